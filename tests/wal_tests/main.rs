//! WAL subsystem tests
