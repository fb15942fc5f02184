use std::collections::{HashMap, HashSet};
use std::hash::BuildHasherDefault;

use fxhash::FxHasher64;

/// A fast map that is not resistant to collision attacks. Works
/// on 8 bytes at a time, which suits segment identifiers.
pub type FastMap8<K, V> = HashMap<K, V, BuildHasherDefault<FxHasher64>>;

/// A fast set that is not resistant to collision attacks. Works
/// on 8 bytes at a time.
pub type FastSet8<V> = HashSet<V, BuildHasherDefault<FxHasher64>>;
