use std::ops::Deref;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Top-level configuration for the system.
///
/// # Examples
///
/// ```
/// let _config = memlog::ConfigBuilder::default()
///     .seglet_size(64 * 1024)
///     .segment_size(1024 * 1024)
///     .initial_segments(64)
///     .disk_expansion_factor(2.0)
///     .build();
/// ```
#[derive(Debug, Clone)]
pub struct Config {
    inner: Arc<ConfigBuilder>,
}

impl Deref for Config {
    type Target = ConfigBuilder;

    fn deref(&self) -> &ConfigBuilder {
        &self.inner
    }
}

/// Build a `Config` for a segment manager and its seglet pool.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct ConfigBuilder {
    #[doc(hidden)]
    pub seglet_size: usize,
    #[doc(hidden)]
    pub segment_size: usize,
    #[doc(hidden)]
    pub initial_segments: usize,
    #[doc(hidden)]
    pub disk_expansion_factor: f64,
}

impl Default for ConfigBuilder {
    fn default() -> ConfigBuilder {
        ConfigBuilder {
            seglet_size: 64 * 1024,
            segment_size: 8 * 1024 * 1024,
            initial_segments: 32,
            disk_expansion_factor: 1.0,
        }
    }
}

macro_rules! builder {
    ($(($name:ident, $set:ident, $t:ty, $desc:expr)),*) => {
        $(
            #[doc=$desc]
            pub fn $set(&mut self, to: $t) {
                self.$name = to;
            }

            #[doc=$desc]
            pub fn $name(mut self, to: $t) -> ConfigBuilder {
                self.$name = to;
                self
            }
        )*
    }
}

impl ConfigBuilder {
    /// Returns a default `ConfigBuilder`.
    pub fn new() -> ConfigBuilder {
        Self::default()
    }

    /// Finalize the configuration.
    pub fn build(self) -> Config {
        Config { inner: Arc::new(self) }
    }

    builder!(
        (
            seglet_size,
            set_seglet_size,
            usize,
            "size in bytes of each seglet, the pooled allocation unit. \
             MUST evenly divide the segment size."
        ),
        (
            segment_size,
            set_segment_size,
            usize,
            "size in bytes of each full segment"
        ),
        (
            initial_segments,
            set_initial_segments,
            usize,
            "number of full segments' worth of seglets to place in the pool"
        ),
        (
            disk_expansion_factor,
            set_disk_expansion_factor,
            f64,
            "multiple of in-memory capacity that may ever exist as \
             segments, counting those pending reclamation on backups. \
             MUST be at least 1.0."
        )
    );
}
