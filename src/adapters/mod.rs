//! Adapters: concrete implementations of the hexagonal port traits.
//!
//! | Adapter        | Implements         | Connects to                  |
//! |----------------|--------------------|------------------------------|
//! | `config_file`  | ConfigPort         | JSON file on disk            |
//! | `delay`        | DelayNs            | Thread sleep / simulated     |
//! | `log_sink`     | EventSink          | `log` facade                 |
//! | `storage`      | StoragePort        | In-memory map / directory    |
//! | `time`         | TimePort           | System clock / manual clock  |

pub mod config_file;
pub mod delay;
pub mod log_sink;
pub mod storage;
pub mod time;
