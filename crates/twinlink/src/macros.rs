// Generates a newtype over an insertion-ordered map keyed by name.
macro_rules! map {
    (
        $(#[$attr:meta])*
        pub struct $name:ident(IndexMap<String, $value:ty, DefaultHashBuilder>);
    ) => {
        $(#[$attr])*
        pub struct $name(IndexMap<String, $value, DefaultHashBuilder>);

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl $name {
            #[doc = concat!("Creates an empty [`", stringify!($name), "`].")]
            #[must_use]
            #[inline]
            pub fn new() -> Self {
                Self(IndexMap::with_hasher(DefaultHashBuilder::default()))
            }

            /// Inserts an entry, returning the previous value for the key.
            #[inline]
            pub fn insert(&mut self, key: impl Into<String>, value: $value) -> Option<$value> {
                self.0.insert(key.into(), value)
            }

            /// Removes an entry, preserving the order of the others.
            #[inline]
            pub fn remove(&mut self, key: &str) -> Option<$value> {
                self.0.shift_remove(key)
            }

            /// Returns the value associated with a key.
            #[must_use]
            #[inline]
            pub fn get(&self, key: &str) -> Option<&$value> {
                self.0.get(key)
            }

            /// Checks whether a key is present.
            #[must_use]
            #[inline]
            pub fn contains_key(&self, key: &str) -> bool {
                self.0.contains_key(key)
            }

            /// Checks whether there are no entries.
            #[must_use]
            #[inline]
            pub fn is_empty(&self) -> bool {
                self.0.is_empty()
            }

            /// Returns the number of entries.
            #[must_use]
            #[inline]
            pub fn len(&self) -> usize {
                self.0.len()
            }

            /// Returns an iterator over the entries in insertion order.
            #[inline]
            pub fn iter(&self) -> indexmap::map::Iter<'_, String, $value> {
                self.0.iter()
            }

            /// Returns an iterator over the keys in insertion order.
            #[inline]
            pub fn keys(&self) -> indexmap::map::Keys<'_, String, $value> {
                self.0.keys()
            }

            /// Keeps only the entries accepted by the predicate.
            #[inline]
            pub fn retain(&mut self, keep: impl FnMut(&String, &mut $value) -> bool) {
                self.0.retain(keep);
            }
        }

        impl<'a> IntoIterator for &'a $name {
            type Item = (&'a String, &'a $value);
            type IntoIter = indexmap::map::Iter<'a, String, $value>;

            fn into_iter(self) -> Self::IntoIter {
                self.0.iter()
            }
        }

        impl IntoIterator for $name {
            type Item = (String, $value);
            type IntoIter = indexmap::map::IntoIter<String, $value>;

            fn into_iter(self) -> Self::IntoIter {
                self.0.into_iter()
            }
        }

        impl<K: Into<String>> FromIterator<(K, $value)> for $name {
            fn from_iter<I: IntoIterator<Item = (K, $value)>>(iter: I) -> Self {
                let mut map = Self::new();
                for (key, value) in iter {
                    let _ = map.insert(key, value);
                }
                map
            }
        }
    };
}

pub(crate) use map;
