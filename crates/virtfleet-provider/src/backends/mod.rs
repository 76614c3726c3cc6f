//! Backend implementations.
//!
//! | Module | Kinds | Transport |
//! |--------|-------|-----------|
//! | [`docker`] | docker | SSH |
//! | [`hypervisor`] | lxd, incus | REST API when configured, SSH otherwise |
//! | [`proxmox`] | proxmox | REST API when configured, SSH otherwise |

use base64::Engine as _;

pub mod docker;
pub mod hypervisor;
pub mod image;
pub mod proxmox;

pub use docker::DockerBackend;
pub use hypervisor::{CliFlavor, HypervisorBackend};
pub use proxmox::ProxmoxBackend;

/// Shell snippet that sets the root password from a base64 payload, so the
/// password never appears unquoted on a command line.
pub(crate) fn chpasswd_script(password: &str) -> String {
    format!("sh -c '{}'", chpasswd_pipeline(password))
}

/// The pipeline inside [`chpasswd_script`], for APIs that take an argv.
pub(crate) fn chpasswd_pipeline(password: &str) -> String {
    let payload = base64::engine::general_purpose::STANDARD.encode(format!("root:{password}"));
    format!("echo {payload} | base64 -d | chpasswd")
}

/// Returns true if backend output says the object does not exist.
pub(crate) fn is_missing(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    ["no such", "not found", "does not exist"]
        .iter()
        .any(|marker| lower.contains(marker))
}
