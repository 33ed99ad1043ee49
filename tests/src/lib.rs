//! # Relay Test Suite
//!
//! Cross-component flows that exercise the bus the way a transport layer
//! would: publish, deliver, persist a cursor, reconnect, acknowledge.
//!
//! ## Structure
//!
//! ```text
//! tests/src/
//! └── integration/
//!     ├── delivery_flow.rs   # publish → batch → cursor → resume
//!     ├── scaleout_flow.rs   # externally ordered mappings, eviction gaps
//!     ├── ack_flow.rs        # callback awaits client acknowledgement
//!     └── telemetry_flow.rs  # global subscriber bootstrap
//! ```
//!
//! ## Running Tests
//!
//! ```bash
//! cargo test -p relay-tests
//! cargo test -p relay-tests integration::scaleout_flow
//! ```

#![allow(dead_code)]

pub mod integration;
