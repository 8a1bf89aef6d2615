#![deny(
    trivial_numeric_casts,
    missing_docs,
    unsafe_code,
    unstable_features,
    unused_import_braces,
    unused_qualifications,
    unused_extern_crates,
    unused_results,
    variant_size_differences
)]
#![warn(rust_2021_compatibility, unreachable_pub)]

//! `outflux` is the output dispatch core of a telemetry-forwarding agent.
//!
//! It takes formatted record batches ("tasks") produced upstream, multiplexes
//! them across configured output destinations (`registry`), runs each
//! destination's flush inside its own async execution context
//! (`dispatch`), and interlocks those contexts with a single-threaded event
//! loop to report completion, retries, and metrics. Input plugins, config
//! file layout beyond what this crate reads, and concrete transport plugins
//! are external collaborators, reachable only through the traits in
//! `plugin`.
//!
//! A configuration file declares the output instances an `engine::Engine`
//! should create; a more programmatic way (direct `registry::Registry`
//! construction) is also possible.

pub use config;
pub use context;
pub use dispatch;
pub use engine;
pub use plugin;
pub use record;
pub use registry;
pub use task;
