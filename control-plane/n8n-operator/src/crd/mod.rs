pub mod gateway;
pub mod monitoring;
pub mod n8n;
