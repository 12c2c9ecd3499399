//! End-to-end scenarios exercising the conveyor, resolver, builder, and
//! cleanup engine together, wired the same way the `kiln` binary wires them
//! but with a fake container engine and a throwaway SQLite registry instead
//! of a Docker daemon.

mod concurrent_race;
mod fresh_build;
mod history_cleanup;
mod stage_content_change;
mod stale_index_reset;
mod support;
