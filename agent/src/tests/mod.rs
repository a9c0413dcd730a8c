//! Cross-component scenario tests (§8 S1-S6). Each module exercises real
//! component wiring end to end rather than a single function in isolation —
//! unit-level coverage for the same code lives alongside it in its own
//! source file.

mod mock_sink;
mod scenario_s1_script;
mod scenario_s2_ping_loss;
mod scenario_s4_http_ingress;
mod scenario_s5_scrape_failover;
mod scenario_s6_registry_swap;
