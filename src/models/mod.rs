pub mod claude;
pub mod machine_id;
pub mod provider_pool_model;
