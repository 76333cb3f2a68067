mod execution;
mod thread_local;
mod work;

pub(crate) use thread_local::{purge_decoupled, schedule_decoupled};
