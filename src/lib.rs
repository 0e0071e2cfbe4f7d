// =============================================================================
// cq-core — file-based multi-process trading system core runtime
// =============================================================================
//
// Library surface for the binary in `main.rs`. Each module corresponds to
// one piece of spec §4: the SSOT path resolver, the atomic file bus, the
// health aggregator, the admission pipeline, the order-router resilience
// layer, the auto-heal FSM, the memory layer, and the singleton guard.
// =============================================================================

pub mod admission;
pub mod autoheal;
pub mod fs_bus;
pub mod health;
pub mod memory;
pub mod router;
pub mod runtime_config;
pub mod singleton;
pub mod ssot;
pub mod types;
