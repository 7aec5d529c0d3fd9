//! CLI command implementations.
//!
//! Each submodule owns one or more related `Commands` variants:
//!
//! | Module          | Commands handled                                   |
//! |-----------------|-----------------------------------------------------|
//! | `serve`         | `Serve`, `InitDb`                                  |

pub mod serve;

pub use serve::{cmd_init_db, cmd_serve};
