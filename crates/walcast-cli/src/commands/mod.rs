mod init;
mod run;
mod slots;

pub use init::cmd_init;
pub use run::cmd_run;
pub use slots::{cmd_slots_drop, cmd_slots_list, cmd_slots_prune};
