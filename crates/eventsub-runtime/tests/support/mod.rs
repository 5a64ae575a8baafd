pub mod mock_eventsub;
pub mod mock_helix;
