//! CLI command implementations.
//!
//! | Module     | Commands handled                     |
//! |------------|--------------------------------------|
//! | `config`   | `Config`                             |
//! | `scripts`  | `Render`, `Templates`                |
//! | `progress` | `Report`, `ServeProgress`            |
//! | `info`     | `Concurrency`, `Phases`              |

pub mod config;
pub mod info;
pub mod progress;
pub mod scripts;

pub use config::cmd_config;
pub use info::{cmd_concurrency, cmd_phases};
pub use progress::{cmd_report, cmd_serve_progress};
pub use scripts::{cmd_render, cmd_templates};
