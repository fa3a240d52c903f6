/// TCP helpers for reaching the local target and binding listeners.
#[cfg(feature = "tcp")]
pub mod tcp;
