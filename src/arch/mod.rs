//! Architecture helpers for `Platform` implementations
//!
//! The scheduler itself is architecture-neutral. A kernel implementing the
//! collaborator traits on bare-metal x86_64 can delegate the interrupt flag,
//! halt, the idle loop and the serial log sink to the `x86_64` submodule.

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub mod x86_64;

/// Spin-wait hint between lock attempts
#[inline]
pub fn cpu_relax() {
    core::hint::spin_loop();
}
