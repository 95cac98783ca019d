pub mod loopdev;
pub mod mount;
pub mod rootfs;

pub use loopdev::LoopMount;
pub use mount::{bind_dir, bind_file, detach, mount, mount_dir, remount, snapshot};
pub use rootfs::{resolve_bind_dest, RootFs};
