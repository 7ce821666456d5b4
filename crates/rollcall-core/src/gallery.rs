//! Known-faces gallery built from an enrollment directory.
//!
//! Layout is one subdirectory per identity, each holding one or more face
//! images: `<root>/<identity>/<image>`. Every image that decodes and yields
//! at least one face contributes one gallery entry.

use crate::embedder::{EmbedError, FaceEmbedder};
use crate::matcher::{MatchResult, Matcher};
use crate::types::{validate_identity, Embedding, GalleryEntry, IdentityError};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use thiserror::Error;
use walkdir::WalkDir;

pub type SharedGallery = Arc<RwLock<Gallery>>;

#[derive(Error, Debug)]
pub enum GalleryError {
    #[error("invalid identity: {0}")]
    Validation(#[from] IdentityError),
    #[error("no image supplied")]
    NoImage,
    #[error("image not found: {}", .0.display())]
    ImageNotFound(PathBuf),
    #[error("enrollment storage error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Why an enrollment image contributed nothing. Logged and skipped, never fatal.
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("cannot decode image: {0}")]
    Image(#[from] image::ImageError),
    #[error("face embedding failed: {0}")]
    Embed(#[from] EmbedError),
    #[error("no face found")]
    NoFace,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadReport {
    pub loaded: usize,
    pub skipped: usize,
}

#[derive(Debug)]
pub struct Gallery {
    root: PathBuf,
    entries: Vec<GalleryEntry>,
}

impl Gallery {
    /// An empty gallery over `root`. Call [`Gallery::load`] to populate it.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            entries: Vec::new(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn entries(&self) -> &[GalleryEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Distinct enrolled identities, sorted.
    pub fn identities(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.entries.iter().map(|e| e.identity.clone()).collect();
        ids.sort();
        ids.dedup();
        ids
    }

    pub fn count_for(&self, identity: &str) -> usize {
        self.entries.iter().filter(|e| e.identity == identity).count()
    }

    /// Rebuild the gallery from disk, discarding whatever was loaded before.
    ///
    /// A missing root is created empty. Images that fail to decode or show
    /// no face are skipped with a warning.
    pub fn load(&mut self, embedder: &mut dyn FaceEmbedder) -> Result<LoadReport, GalleryError> {
        self.entries.clear();
        fs::create_dir_all(&self.root).map_err(|source| GalleryError::Io {
            path: self.root.clone(),
            source,
        })?;

        let mut report = LoadReport::default();
        let people = WalkDir::new(&self.root)
            .min_depth(1)
            .max_depth(1)
            .follow_links(true)
            .sort_by_file_name();

        for person in people {
            let person = match person {
                Ok(person) => person,
                // Depth 0 is the root itself.
                Err(e) if e.depth() == 0 => {
                    return Err(GalleryError::Io {
                        path: self.root.clone(),
                        source: e.into(),
                    })
                }
                Err(e) => {
                    tracing::warn!(root = %self.root.display(), error = %e, "cannot read identity entry, skipping");
                    report.skipped += 1;
                    continue;
                }
            };
            if !person.file_type().is_dir() {
                continue;
            }
            let Some(identity) = person.file_name().to_str() else {
                tracing::warn!(path = %person.path().display(), "identity directory name is not UTF-8, skipping");
                continue;
            };
            if let Err(e) = validate_identity(identity) {
                tracing::warn!(identity, error = %e, "unusable identity directory, skipping");
                continue;
            }
            self.load_identity(identity, person.path(), embedder, &mut report);
        }

        tracing::info!(
            root = %self.root.display(),
            loaded = report.loaded,
            skipped = report.skipped,
            identities = self.identities().len(),
            "known faces loaded"
        );
        Ok(report)
    }

    fn load_identity(
        &mut self,
        identity: &str,
        dir: &Path,
        embedder: &mut dyn FaceEmbedder,
        report: &mut LoadReport,
    ) {
        let images = WalkDir::new(dir)
            .min_depth(1)
            .max_depth(1)
            .follow_links(true)
            .sort_by_file_name();

        for image in images {
            let image = match image {
                Ok(image) => image,
                Err(e) => {
                    tracing::warn!(identity, error = %e, "cannot read enrollment entry, skipping");
                    report.skipped += 1;
                    continue;
                }
            };
            if !image.file_type().is_file() {
                continue;
            }
            match embed_image(image.path(), embedder) {
                Ok(embedding) => {
                    tracing::debug!(identity, path = %image.path().display(), "enrolled face");
                    self.entries.push(GalleryEntry {
                        identity: identity.to_string(),
                        embedding,
                    });
                    report.loaded += 1;
                }
                Err(e) => {
                    tracing::warn!(identity, path = %image.path().display(), error = %e, "skipping enrollment image");
                    report.skipped += 1;
                }
            }
        }
    }

    /// Store `image_path` under `identity` and rebuild the gallery.
    ///
    /// The image is moved into the enrollment directory; a file of the same
    /// name already enrolled for that identity is replaced.
    pub fn register(
        &mut self,
        identity: &str,
        image_path: &Path,
        embedder: &mut dyn FaceEmbedder,
    ) -> Result<LoadReport, GalleryError> {
        let identity = validate_identity(identity)?;
        if image_path.as_os_str().is_empty() {
            return Err(GalleryError::NoImage);
        }
        if !image_path.is_file() {
            return Err(GalleryError::ImageNotFound(image_path.to_path_buf()));
        }
        let file_name = image_path.file_name().ok_or(GalleryError::NoImage)?;

        let person_dir = self.root.join(identity);
        fs::create_dir_all(&person_dir).map_err(|source| GalleryError::Io {
            path: person_dir.clone(),
            source,
        })?;
        let dest = person_dir.join(file_name);
        move_file(image_path, &dest).map_err(|source| GalleryError::Io {
            path: dest.clone(),
            source,
        })?;
        tracing::info!(identity, path = %dest.display(), "stored enrollment image");

        self.load(embedder)
    }

    pub fn identify(&self, probe: &Embedding, matcher: &dyn Matcher, threshold: f32) -> MatchResult {
        matcher.identify(probe, &self.entries, threshold)
    }
}

fn embed_image(path: &Path, embedder: &mut dyn FaceEmbedder) -> Result<Embedding, DecodeError> {
    let image = image::open(path)?.to_rgb8();
    let faces = embedder.detect_and_embed(&image)?;
    faces
        .into_iter()
        .next()
        .map(|face| face.embedding)
        .ok_or(DecodeError::NoFace)
}

/// Rename, falling back to copy-and-remove across filesystems.
fn move_file(from: &Path, to: &Path) -> io::Result<()> {
    if fs::rename(from, to).is_ok() {
        return Ok(());
    }
    fs::copy(from, to)?;
    fs::remove_file(from)
}
