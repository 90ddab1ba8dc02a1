//! # Mesh Test Utilities
//!
//! Fakes and fixtures for exercising mesh nodes in one process, without
//! Redis or real ICE.
//!
//! ## Modules
//!
//! - `loopback` - in-process peer transport with controllable state and stats
//! - `mock_capture` - media capture that succeeds or is denied
//! - `flaky_store` - document store wrapper that injects failures and stalls
//! - `fixtures` - shared clock, fast session config, room harness
//!
//! ## Usage
//!
//! ```rust,ignore
//! use mesh_test_utils::*;
//!
//! #[tokio::test(start_paused = true)]
//! async fn test_example() {
//!     let room = TestRoom::new();
//!     let alice = room.join("alice").await.unwrap();
//!     let bob = room.join("bob").await.unwrap();
//!
//!     wait_for_view(&mut alice.view(), |v| v.connected_links() == 1).await;
//! }
//! ```

pub mod fixtures;
pub mod flaky_store;
pub mod loopback;
pub mod mock_capture;

// Re-export commonly used items
pub use fixtures::*;
pub use flaky_store::*;
pub use loopback::*;
pub use mock_capture::*;
