// Copyright 2018-2024 the Deno authors. MIT license.

use std::cell::Cell;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::Arc;

use deno_error::JsErrorBox;
use deno_error::JsErrorClass;
use futures::future;
use futures::future::LocalBoxFuture;
use thiserror::Error;

use crate::uri::InvalidVirtualUriError;
use crate::uri::ModuleSpecifier;

/// A read-only snapshot of a document's text, the slice of the host
/// editor's buffer model the core needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Document {
  pub specifier: ModuleSpecifier,
  pub content: Arc<str>,
}

impl Document {
  pub fn new(
    specifier: ModuleSpecifier,
    content: impl Into<Arc<str>>,
  ) -> Self {
    Self {
      specifier,
      content: content.into(),
    }
  }

  pub fn text(&self) -> &str {
    &self.content
  }

  pub fn lines(&self) -> Vec<&str> {
    self.content.lines().collect()
  }

  pub fn line_count(&self) -> usize {
    self.content.lines().count()
  }
}

#[derive(Debug, Error, deno_error::JsError)]
pub enum LoadError {
  #[class("NotFound")]
  #[error("Not found: {specifier}")]
  NotFound { specifier: ModuleSpecifier },
  #[class(generic)]
  #[error("Remote download is disabled in settings: {specifier}")]
  RemoteFetchDisabled { specifier: ModuleSpecifier },
  #[class(inherit)]
  #[error(transparent)]
  InvalidVirtualUri(#[from] InvalidVirtualUriError),
  #[class(generic)]
  #[error("Load was cancelled")]
  Cancelled,
  #[class(inherit)]
  #[error(transparent)]
  Other(Arc<dyn JsErrorClass>),
}

pub type LoadResult = Result<Option<Document>, LoadError>;
pub type LoadFuture = LocalBoxFuture<'static, LoadResult>;

/// A trait which allows asynchronous loading of document text for the
/// schemes the host editor handles natively (typically `file:`). The
/// store's internal schemes never reach the loader.
pub trait DocumentLoader {
  /// A method that given a specifier asynchronously returns the text of
  /// the document, or `Ok(None)` when it does not exist.
  fn load(&self, specifier: &ModuleSpecifier) -> LoadFuture;

  /// Existence probe, only ever called for `file:` scheme specifiers.
  fn exists(
    &self,
    specifier: &ModuleSpecifier,
  ) -> LocalBoxFuture<'static, bool>;
}

/// Performs the network fetch for remote passthrough content. The store
/// strips the internal scheme prefix and checks the settings gate before
/// calling.
pub trait RemoteFetcher {
  fn fetch(&self, specifier: &ModuleSpecifier) -> LoadFuture;
}

pub type WatchCallback = Box<dyn Fn()>;

/// Change/delete notifications for local files, used solely for cache
/// invalidation.
pub trait FileChangeWatcher {
  /// Subscribes `on_event` to change and delete events for a `file:`
  /// specifier. Dropping the returned subscription unsubscribes.
  fn watch(
    &self,
    specifier: &ModuleSpecifier,
    on_event: WatchCallback,
  ) -> Result<Box<dyn WatchSubscription>, JsErrorBox>;
}

pub trait WatchSubscription {}

/// Cooperative cancellation signal for resolution operations. A cancelled
/// operation returns early without committing cache entries.
#[derive(Debug, Default, Clone)]
pub struct CancellationToken {
  cancelled: Rc<Cell<bool>>,
}

impl CancellationToken {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn cancel(&self) {
    self.cancelled.set(true);
  }

  pub fn is_cancelled(&self) -> bool {
    self.cancelled.get()
  }
}

/// An implementation of the loader where the documents are provided ahead
/// of time. This is useful for testing or for hosts that snapshot their
/// open buffers.
#[derive(Default)]
pub struct MemoryLoader {
  sources:
    RefCell<HashMap<ModuleSpecifier, Result<Arc<str>, Arc<dyn JsErrorClass>>>>,
  load_counts: RefCell<HashMap<ModuleSpecifier, usize>>,
}

impl MemoryLoader {
  pub fn new<S: AsRef<str>>(sources: Vec<(S, S)>) -> Self {
    let loader = Self::default();
    for (specifier, text) in sources {
      loader.add_source_with_text(specifier, text);
    }
    loader
  }

  pub fn add_source_with_text(
    &self,
    specifier: impl AsRef<str>,
    text: impl AsRef<str>,
  ) {
    let specifier = ModuleSpecifier::parse(specifier.as_ref()).unwrap();
    self
      .sources
      .borrow_mut()
      .insert(specifier, Ok(Arc::from(text.as_ref())));
  }

  pub fn add_error_source(
    &self,
    specifier: impl AsRef<str>,
    error: Arc<dyn JsErrorClass>,
  ) {
    let specifier = ModuleSpecifier::parse(specifier.as_ref()).unwrap();
    self.sources.borrow_mut().insert(specifier, Err(error));
  }

  pub fn remove_source(&self, specifier: &ModuleSpecifier) {
    self.sources.borrow_mut().remove(specifier);
  }

  /// The number of times a specifier has been loaded, for cache
  /// assertions.
  pub fn load_count(&self, specifier: &ModuleSpecifier) -> usize {
    self
      .load_counts
      .borrow()
      .get(specifier)
      .copied()
      .unwrap_or(0)
  }
}

impl DocumentLoader for MemoryLoader {
  fn load(&self, specifier: &ModuleSpecifier) -> LoadFuture {
    *self
      .load_counts
      .borrow_mut()
      .entry(specifier.clone())
      .or_default() += 1;
    let result = match self.sources.borrow().get(specifier) {
      Some(Ok(content)) => Ok(Some(Document {
        specifier: specifier.clone(),
        content: content.clone(),
      })),
      Some(Err(error)) => Err(LoadError::Other(error.clone())),
      None => Ok(None),
    };
    Box::pin(future::ready(result))
  }

  fn exists(
    &self,
    specifier: &ModuleSpecifier,
  ) -> LocalBoxFuture<'static, bool> {
    let exists = matches!(self.sources.borrow().get(specifier), Some(Ok(_)));
    Box::pin(future::ready(exists))
  }
}

impl RemoteFetcher for MemoryLoader {
  fn fetch(&self, specifier: &ModuleSpecifier) -> LoadFuture {
    DocumentLoader::load(self, specifier)
  }
}

/// A loader reading local `file:` documents straight from the filesystem.
/// Hosts embedded in an editor usually substitute a loader backed by the
/// editor's live buffer contents instead.
#[derive(Debug, Default, Clone, Copy)]
pub struct FsDocumentLoader;

impl DocumentLoader for FsDocumentLoader {
  fn load(&self, specifier: &ModuleSpecifier) -> LoadFuture {
    let result = load_local(specifier);
    Box::pin(future::ready(result))
  }

  fn exists(
    &self,
    specifier: &ModuleSpecifier,
  ) -> LocalBoxFuture<'static, bool> {
    let exists = deno_path_util::url_to_file_path(specifier)
      .map(|path| path.exists())
      .unwrap_or(false);
    Box::pin(future::ready(exists))
  }
}

fn load_local(specifier: &ModuleSpecifier) -> LoadResult {
  if specifier.scheme() != "file" {
    return Ok(None);
  }
  let Ok(path) = deno_path_util::url_to_file_path(specifier) else {
    return Ok(None);
  };
  match std::fs::read_to_string(&path) {
    Ok(text) => Ok(Some(Document::new(specifier.clone(), text))),
    Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
    Err(err) => Err(LoadError::Other(Arc::new(err))),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use pretty_assertions::assert_eq;

  #[test]
  fn test_document_lines() {
    let document = Document::new(
      ModuleSpecifier::parse("file:///proj/min.js").unwrap(),
      "var a=1;\nvar b=2;",
    );
    assert_eq!(document.line_count(), 2);
    assert_eq!(document.lines(), vec!["var a=1;", "var b=2;"]);
  }

  #[tokio::test]
  async fn test_memory_loader_counts_loads() {
    let loader = MemoryLoader::new(vec![("file:///proj/min.js", "var a=1;")]);
    let specifier = ModuleSpecifier::parse("file:///proj/min.js").unwrap();
    assert_eq!(loader.load_count(&specifier), 0);
    let document = loader.load(&specifier).await.unwrap().unwrap();
    assert_eq!(document.text(), "var a=1;");
    loader.load(&specifier).await.unwrap().unwrap();
    assert_eq!(loader.load_count(&specifier), 2);

    let missing = ModuleSpecifier::parse("file:///proj/other.js").unwrap();
    assert_eq!(loader.load(&missing).await.unwrap(), None);
    assert!(!loader.exists(&missing).await);
  }

  #[test]
  fn test_cancellation_token() {
    let token = CancellationToken::new();
    let other = token.clone();
    assert!(!token.is_cancelled());
    other.cancel();
    assert!(token.is_cancelled());
  }
}
