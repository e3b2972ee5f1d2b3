use std::fmt;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::str::FromStr;

use foldhash::HashMap;
use tracing::{debug, trace};

use crate::{Error, Result};

/// Names a resource as `scheme:path`.
///
/// The scheme selects which sources and pools are interested in the resource; the path is
/// interpreted by each source in its own way.
///
/// # Examples
///
/// ```
/// use handle_pool::Locator;
///
/// let locator: Locator = "texture:terrain/grass.png".parse().unwrap();
///
/// assert_eq!(locator.scheme(), "texture");
/// assert_eq!(locator.path(), "terrain/grass.png");
/// assert_eq!(locator.to_string(), "texture:terrain/grass.png");
/// ```
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct Locator {
    scheme: String,
    path: String,
}

impl Locator {
    /// Creates a locator from its parts.
    ///
    /// # Panics
    ///
    /// Panics if the scheme is empty or contains a `:`.
    #[must_use]
    pub fn new(scheme: impl Into<String>, path: impl Into<String>) -> Self {
        let scheme = scheme.into();

        assert!(
            !scheme.is_empty() && !scheme.contains(':'),
            "invalid locator scheme '{scheme}'"
        );

        Self {
            scheme,
            path: path.into(),
        }
    }

    /// The part before the first `:`.
    #[must_use]
    #[inline]
    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    /// The part after the first `:`.
    #[must_use]
    #[inline]
    pub fn path(&self) -> &str {
        &self.path
    }
}

impl FromStr for Locator {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let Some((scheme, path)) = s.split_once(':') else {
            return Err(Error::malformed(format!(
                "locator '{s}' has no scheme separator"
            )));
        };

        if scheme.is_empty() {
            return Err(Error::malformed(format!("locator '{s}' has an empty scheme")));
        }

        Ok(Self {
            scheme: scheme.to_string(),
            path: path.to_string(),
        })
    }
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.scheme, self.path)
    }
}

/// Produces the raw bytes of resources.
///
/// Sources are consulted through [`Loaders`]. A source that does not know a resource returns
/// `Ok(None)` so the next source gets a chance; an error means the source knows the resource
/// but failed to read it.
pub trait ResourceSource {
    /// Returns the bytes of the resource, or `None` if this source does not have it.
    ///
    /// # Errors
    ///
    /// Returns an error if the resource exists in this source but could not be read.
    fn open(&self, locator: &Locator) -> Result<Option<Vec<u8>>>;
}

/// A source serving resources from memory.
///
/// # Examples
///
/// ```
/// use handle_pool::{Locator, MemorySource, ResourceSource};
///
/// let mut source = MemorySource::new();
/// source.insert(Locator::new("cfg", "main"), b"volume=3".to_vec());
///
/// let bytes = source.open(&Locator::new("cfg", "main")).unwrap();
/// assert_eq!(bytes.as_deref(), Some(&b"volume=3"[..]));
/// assert!(source.open(&Locator::new("cfg", "other")).unwrap().is_none());
/// ```
#[derive(Debug, Default)]
pub struct MemorySource {
    resources: HashMap<Locator, Vec<u8>>,
}

impl MemorySource {
    /// Creates an empty source.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces a resource.
    pub fn insert(&mut self, locator: Locator, bytes: Vec<u8>) {
        self.resources.insert(locator, bytes);
    }
}

impl ResourceSource for MemorySource {
    fn open(&self, locator: &Locator) -> Result<Option<Vec<u8>>> {
        Ok(self.resources.get(locator).cloned())
    }
}

/// A source serving resources from files under a root directory.
///
/// The locator path is resolved relative to the root. Paths that would leave the root (absolute
/// paths, `..` and similar) are not served.
#[derive(Debug)]
pub struct DirectorySource {
    root: PathBuf,
    scheme: Option<String>,
}

impl DirectorySource {
    /// Serves every scheme from files under `root`.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            scheme: None,
        }
    }

    /// Restricts the source to locators with the given scheme.
    #[must_use]
    pub fn with_scheme(mut self, scheme: impl Into<String>) -> Self {
        self.scheme = Some(scheme.into());
        self
    }

    fn resolve(&self, path: &str) -> Option<PathBuf> {
        let relative = Path::new(path);

        let mut components = relative.components().peekable();
        components.peek()?;

        if !components.all(|component| matches!(component, Component::Normal(_))) {
            return None;
        }

        Some(self.root.join(relative))
    }
}

impl ResourceSource for DirectorySource {
    fn open(&self, locator: &Locator) -> Result<Option<Vec<u8>>> {
        if self
            .scheme
            .as_deref()
            .is_some_and(|scheme| scheme != locator.scheme())
        {
            return Ok(None);
        }

        let Some(path) = self.resolve(locator.path()) else {
            debug!(%locator, "locator path escapes the source root");
            return Ok(None);
        };

        match std::fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(Error::Io {
                locator: locator.to_string(),
                source,
            }),
        }
    }
}

/// An ordered set of [`ResourceSource`]s.
///
/// Sources are consulted from the highest priority down; sources with equal priority are
/// consulted in the order they were added. The first source that has the resource wins.
///
/// # Examples
///
/// ```
/// use handle_pool::{Loaders, Locator, MemorySource};
///
/// let locator = Locator::new("text", "motd");
///
/// let mut fallback = MemorySource::new();
/// fallback.insert(locator.clone(), b"default".to_vec());
///
/// let mut patch = MemorySource::new();
/// patch.insert(locator.clone(), b"patched".to_vec());
///
/// let mut loaders = Loaders::new();
/// loaders.add(0, fallback);
/// loaders.add(10, patch);
///
/// assert_eq!(loaders.fetch(&locator).unwrap().as_deref(), Some(&b"patched"[..]));
/// ```
#[derive(Default)]
pub struct Loaders {
    sources: Vec<(i32, Box<dyn ResourceSource>)>,
}

impl Loaders {
    /// Creates a set without sources.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a source. Higher priorities are consulted first.
    pub fn add(&mut self, priority: i32, source: impl ResourceSource + 'static) {
        // After all sources of the same or higher priority, to keep insertion order among equals.
        let position = self
            .sources
            .partition_point(|(existing, _)| *existing >= priority);

        self.sources.insert(position, (priority, Box::new(source)));
    }

    /// The number of sources.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sources.len()
    }

    /// Whether there are no sources.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    /// Returns the bytes of the resource from the first source that has it.
    ///
    /// A failing source does not stop the search. Its error is only returned if no later source
    /// has the resource either.
    ///
    /// # Errors
    ///
    /// Returns the first error reported by a source, if no source produced the resource.
    pub fn fetch(&self, locator: &Locator) -> Result<Option<Vec<u8>>> {
        let mut first_error = None;

        for (priority, source) in &self.sources {
            match source.open(locator) {
                Ok(Some(bytes)) => {
                    trace!(%locator, priority, len = bytes.len(), "resource fetched");
                    return Ok(Some(bytes));
                }
                Ok(None) => {}
                Err(error) => {
                    debug!(%locator, priority, %error, "resource source failed");
                    first_error.get_or_insert(error);
                }
            }
        }

        first_error.map_or(Ok(None), Err)
    }
}

impl fmt::Debug for Loaders {
    #[cfg_attr(test, mutants::skip)] // No API contract to test.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let priorities: Vec<i32> = self.sources.iter().map(|(priority, _)| *priority).collect();

        f.debug_struct("Loaders")
            .field("priorities", &priorities)
            .finish()
    }
}
