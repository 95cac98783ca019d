pub mod clone3;
pub mod unix;

pub use clone3::{
    clone3, Clone3Args, CLONE_NEWIPC, CLONE_NEWNET, CLONE_NEWNS, CLONE_NEWPID, CLONE_NEWUTS,
};
pub use unix::{
    gettid, reset_all_signal_handlers, set_child_subreaper, set_die_on_parent_exit,
    set_process_name,
};
