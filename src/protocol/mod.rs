//! Wire protocol: control channel codec and the default transport

pub(crate) mod wire;

pub mod ftp;

// vim: ts=4
