//! Locates and loads the MXNet shared library.
//!
//! Candidate paths are tried in a fixed order: an explicit path from the
//! configuration, the `LIBMXNET` environment variable, then the platform
//! library filename joined against the configured search paths and the
//! dynamic-linker path variable. The first candidate that exists on disk is
//! loaded; when no candidate exists the error lists every path tried.

use std::path::PathBuf;

use libloading::Library;

use crate::config::Config;
use crate::error::{Error, Result};

/// A loaded library together with the path it came from.
pub(crate) struct LoadedLibrary {
    pub path: PathBuf,
    pub library: Library,
}

/// Loads the first existing candidate for the given configuration.
pub(crate) fn load(config: &Config) -> Result<LoadedLibrary> {
    let candidates = candidate_paths(config);
    let path = match candidates.iter().find(|p| p.is_file()) {
        Some(path) => path.clone(),
        None => {
            return Err(Error::LibraryNotFound {
                candidates: candidates
                    .iter()
                    .map(|p| p.display().to_string())
                    .collect(),
            })
        }
    };

    // Safety: loading a shared library runs its initializers. The path was
    // chosen by the user's configuration, so it is trusted the same way the
    // native runtime itself is.
    let library = unsafe {
        Library::new(&path).map_err(|e| Error::LibraryLoadFailed {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?
    };

    Ok(LoadedLibrary { path, library })
}

/// Builds the ordered candidate list for the configuration.
pub(crate) fn candidate_paths(config: &Config) -> Vec<PathBuf> {
    let mut candidates = Vec::new();

    if let Some(path) = &config.library.path {
        candidates.push(path.clone());
    }

    if let Ok(path) = std::env::var("LIBMXNET") {
        if !path.is_empty() {
            candidates.push(PathBuf::from(path));
        }
    }

    let filename = library_filename();
    for dir in config
        .library
        .search_paths
        .iter()
        .cloned()
        .chain(default_search_paths())
    {
        candidates.push(dir.join(&filename));
    }

    candidates.dedup();
    candidates
}

/// Default library search paths for this platform.
fn default_search_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();

    #[cfg(target_os = "linux")]
    {
        paths.push(PathBuf::from("/usr/lib"));
        paths.push(PathBuf::from("/usr/local/lib"));
        paths.push(PathBuf::from("/usr/lib64"));

        if let Ok(ld_path) = std::env::var("LD_LIBRARY_PATH") {
            for p in ld_path.split(':').filter(|p| !p.is_empty()) {
                paths.push(PathBuf::from(p));
            }
        }
    }

    #[cfg(target_os = "macos")]
    {
        paths.push(PathBuf::from("/usr/local/lib"));
        paths.push(PathBuf::from("/opt/homebrew/lib"));

        if let Ok(dyld_path) = std::env::var("DYLD_LIBRARY_PATH") {
            for p in dyld_path.split(':').filter(|p| !p.is_empty()) {
                paths.push(PathBuf::from(p));
            }
        }
    }

    #[cfg(target_os = "windows")]
    {
        if let Ok(path) = std::env::var("PATH") {
            for p in path.split(';').filter(|p| !p.is_empty()) {
                paths.push(PathBuf::from(p));
            }
        }
    }

    paths
}

/// Platform-specific file name of the MXNet shared library.
fn library_filename() -> String {
    #[cfg(target_os = "linux")]
    {
        "libmxnet.so".to_string()
    }

    #[cfg(target_os = "macos")]
    {
        "libmxnet.dylib".to_string()
    }

    #[cfg(target_os = "windows")]
    {
        "mxnet.dll".to_string()
    }

    #[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
    {
        "libmxnet.so".to_string()
    }
}
