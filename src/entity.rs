pub mod campaign;
pub mod donation;
pub mod sea_orm_active_enums;
pub mod webhook_event;
