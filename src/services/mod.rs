pub mod health_check_service;
pub mod pool_persistence_service;
pub mod provider_pool_service;
pub mod sticky_session_service;
