
// The system backend is selected at build time, see build.rs. This
// defaults to sys/std.rs, or sys/loom.rs when model checking, and can be
// overridden with EVQ_SYS_PATH for other targets.
include!(env!("EVQ_SYS_PATH"));
