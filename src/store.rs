// Copyright 2018-2024 the Deno authors. MIT license.

use std::cell::RefCell;
use std::rc::Rc;
use std::rc::Weak;
use std::sync::Arc;

use data_url::DataUrl;
use deno_error::JsErrorBox;
use futures::future::LocalBoxFuture;
use indexmap::IndexMap;
use thiserror::Error;

use crate::item::SourceMapItem;
use crate::item::SourceMapParseError;
use crate::scanner;
use crate::scanner::SourceMapLink;
use crate::settings::Settings;
use crate::source::CancellationToken;
use crate::source::Document;
use crate::source::DocumentLoader;
use crate::source::FileChangeWatcher;
use crate::source::LoadError;
use crate::source::RemoteFetcher;
use crate::source::WatchSubscription;
use crate::uri::decode_source_specifier;
use crate::uri::dir_specifier;
use crate::uri::encode_source_specifier;
use crate::uri::from_remote_transport;
use crate::uri::map_base_specifier;
use crate::uri::resolve_source_specifier;
use crate::uri::InvalidVirtualUriError;
use crate::uri::ModuleSpecifier;
use crate::uri::INLINE_MAP_SCHEME;
use crate::uri::SOURCE_SCHEME;

#[derive(Debug, Error, deno_error::JsError)]
pub enum SourceMapLoadError {
  #[class(inherit)]
  #[error(transparent)]
  Load(#[from] LoadError),
  #[class(inherit)]
  #[error(transparent)]
  Parse(#[from] SourceMapParseError),
}

impl SourceMapLoadError {
  fn is_cancelled(&self) -> bool {
    matches!(self, Self::Load(LoadError::Cancelled))
  }
}

#[derive(Debug, Error, deno_error::JsError)]
pub enum ResolveSourceMapError {
  /// The document carries no sourceMappingURL reference and no sibling
  /// `.map` file exists next to it.
  #[class("NotFound")]
  #[error(
    "{specifier}: No sourceMappingURL nor .map file with same name as source"
  )]
  NoSourceMapFound { specifier: ModuleSpecifier },
  /// A map specifier was resolved but its content failed to load or
  /// parse.
  #[class(generic)]
  #[error("{specifier}: Cannot load sourcemap from URI {map_specifier}: {source}")]
  LoadFailed {
    specifier: ModuleSpecifier,
    map_specifier: ModuleSpecifier,
    #[source]
    source: SourceMapLoadError,
  },
  #[class(generic)]
  #[error("Resolution was cancelled")]
  Cancelled,
}

pub struct SourceMapStoreOptions {
  pub loader: Rc<dyn DocumentLoader>,
  pub maybe_fetcher: Option<Rc<dyn RemoteFetcher>>,
  pub maybe_watcher: Option<Rc<dyn FileChangeWatcher>>,
  pub settings: Settings,
}

/// The central orchestrator. Resolves generated documents to their source
/// maps, caches parsed maps keyed by canonical specifier, serves content
/// for the internal schemes, and evicts cache entries when watched local
/// files change.
///
/// Cloning is cheap and clones share the same caches.
#[derive(Clone)]
pub struct SourceMapStore {
  inner: Rc<StoreInner>,
}

struct StoreInner {
  loader: Rc<dyn DocumentLoader>,
  maybe_fetcher: Option<Rc<dyn RemoteFetcher>>,
  maybe_watcher: Option<Rc<dyn FileChangeWatcher>>,
  settings: Settings,
  by_document: RefCell<IndexMap<ModuleSpecifier, Rc<SourceMapItem>>>,
  by_map: RefCell<IndexMap<ModuleSpecifier, Rc<SourceMapItem>>>,
  watches: RefCell<IndexMap<ModuleSpecifier, Box<dyn WatchSubscription>>>,
}

impl StoreInner {
  /// Removes every cache entry sharing the artifact cached under
  /// `specifier`, regardless of which table the key lives in, and drops
  /// the associated watches.
  fn evict(&self, specifier: &ModuleSpecifier) {
    let maybe_item = self
      .by_map
      .borrow()
      .get(specifier)
      .cloned()
      .or_else(|| self.by_document.borrow().get(specifier).cloned());
    let mut removed_keys = vec![specifier.clone()];
    if let Some(item) = maybe_item {
      self.by_map.borrow_mut().retain(|key, value| {
        if Rc::ptr_eq(value, &item) {
          removed_keys.push(key.clone());
          false
        } else {
          true
        }
      });
      self.by_document.borrow_mut().retain(|key, value| {
        if Rc::ptr_eq(value, &item) {
          removed_keys.push(key.clone());
          false
        } else {
          true
        }
      });
    }
    let mut dropped_watches = Vec::with_capacity(removed_keys.len());
    {
      let mut watches = self.watches.borrow_mut();
      for key in &removed_keys {
        if let Some(subscription) = watches.shift_remove(key) {
          dropped_watches.push(subscription);
        }
      }
    }
    // dropping a subscription may call back into the host, so it happens
    // outside the table borrows
    drop(dropped_watches);
  }
}

impl SourceMapStore {
  pub fn new(options: SourceMapStoreOptions) -> Self {
    Self {
      inner: Rc::new(StoreInner {
        loader: options.loader,
        maybe_fetcher: options.maybe_fetcher,
        maybe_watcher: options.maybe_watcher,
        settings: options.settings,
        by_document: Default::default(),
        by_map: Default::default(),
        watches: Default::default(),
      }),
    }
  }

  /// Opens a document for any supported scheme. The internal schemes
  /// (`sourcemap:`, `sourcemap-source:`, `sourcemap-http:`/`-https:`) are
  /// served by the store itself, everything else goes through the loader.
  pub async fn open_document(
    &self,
    specifier: &ModuleSpecifier,
    token: &CancellationToken,
  ) -> Result<Document, LoadError> {
    self
      .open_document_inner(specifier.clone(), token.clone(), Vec::new())
      .await
  }

  /// Loads a source map and caches it by its specifier. `file:` scheme
  /// maps are watched and evicted from the cache upon change or delete.
  pub async fn load_source_map(
    &self,
    map_specifier: &ModuleSpecifier,
    token: &CancellationToken,
  ) -> Result<Rc<SourceMapItem>, SourceMapLoadError> {
    let maybe_item = self.inner.by_map.borrow().get(map_specifier).cloned();
    if let Some(item) = maybe_item {
      return Ok(item);
    }
    let document = self
      .open_document_inner(map_specifier.clone(), token.clone(), Vec::new())
      .await?;
    if token.is_cancelled() {
      return Err(LoadError::Cancelled.into());
    }
    let base_specifier =
      map_base_specifier(map_specifier).map_err(LoadError::from)?;
    let item = Rc::new(SourceMapItem::from_slice(
      document.text().as_bytes(),
      map_specifier.clone(),
      base_specifier,
    )?);
    // two interleaved loads of the same uncached map can both get here;
    // the last insert wins and the duplicated work is tolerated
    self.insert_map_entry(map_specifier, &item);
    Ok(item)
  }

  /// Returns the source map for a generated document, or a detailed typed
  /// failure when no usable map exists.
  pub async fn get_for_document(
    &self,
    document: &Document,
    token: &CancellationToken,
  ) -> Result<Rc<SourceMapItem>, ResolveSourceMapError> {
    let document_specifier = &document.specifier;
    let maybe_item = self
      .inner
      .by_document
      .borrow()
      .get(document_specifier)
      .cloned();
    if let Some(item) = maybe_item {
      return Ok(item);
    }

    let maybe_link = match self.find_source_map_link(document, token).await {
      Ok(maybe_link) => maybe_link,
      Err(err) if err.is_cancelled() => {
        return Err(ResolveSourceMapError::Cancelled)
      }
      Err(err) => {
        return Err(ResolveSourceMapError::LoadFailed {
          specifier: document_specifier.clone(),
          map_specifier: document_specifier.clone(),
          source: err,
        })
      }
    };
    let map_specifier = match maybe_link {
      Some(link) => link.target,
      None => {
        // no explicit link, a sibling .map file next to the document
        // still counts
        match self.sibling_map_specifier(document_specifier).await {
          Some(specifier) => specifier,
          None => {
            return Err(ResolveSourceMapError::NoSourceMapFound {
              specifier: document_specifier.clone(),
            })
          }
        }
      }
    };
    if token.is_cancelled() {
      return Err(ResolveSourceMapError::Cancelled);
    }

    let item = match self.load_source_map(&map_specifier, token).await {
      Ok(item) => item,
      Err(err) if err.is_cancelled() => {
        return Err(ResolveSourceMapError::Cancelled)
      }
      Err(err) => {
        return Err(ResolveSourceMapError::LoadFailed {
          specifier: document_specifier.clone(),
          map_specifier,
          source: err,
        })
      }
    };
    if token.is_cancelled() {
      return Err(ResolveSourceMapError::Cancelled);
    }
    self.insert_document_entry(document_specifier, &item);
    Ok(item)
  }

  /// Returns the source map for a generated document or `None`, logging
  /// failures. For call sites where a missing map is routine rather than
  /// exceptional.
  pub async fn get_for_document_no_throw(
    &self,
    document: &Document,
    token: &CancellationToken,
  ) -> Option<Rc<SourceMapItem>> {
    match self.get_for_document(document, token).await {
      Ok(item) => Some(item),
      Err(err) => {
        log::error!("{}: {}", document.specifier, err);
        None
      }
    }
  }

  /// Scans a document for its sourceMappingURL reference. For a virtual
  /// `sourcemap-source:` document the reference resolves against the
  /// directory of the decoded real source rather than the virtual
  /// specifier itself.
  pub async fn find_source_map_link(
    &self,
    document: &Document,
    token: &CancellationToken,
  ) -> Result<Option<SourceMapLink>, SourceMapLoadError> {
    let document_base = if document.specifier.scheme() == SOURCE_SCHEME {
      match self.virtual_document_base(&document.specifier, token).await {
        Ok(base) => base,
        Err(err) if err.is_cancelled() => return Err(err),
        Err(err) => {
          log::warn!("{}: {}", document.specifier, err);
          dir_specifier(&document.specifier)
        }
      }
    } else {
      dir_specifier(&document.specifier)
    };
    Ok(scanner::scan(document, &document_base))
  }

  /// Resolves a map's `source` field to the specifier a caller should
  /// open. When the source resolves to a `file:` specifier that exists on
  /// disk that file wins, so edits and breakpoints target the real file;
  /// otherwise an indirect `sourcemap-source:` specifier is returned whose
  /// content falls back to the map's embedded `sourcesContent`.
  pub async fn resolve_source_location(
    &self,
    item: &SourceMapItem,
    source: &str,
  ) -> ModuleSpecifier {
    if let Ok(real_specifier) =
      resolve_source_specifier(source, item.base_specifier())
    {
      if real_specifier.scheme() == "file"
        && self.inner.loader.exists(&real_specifier).await
      {
        return real_specifier;
      }
    }
    encode_source_specifier(item.map_specifier(), source)
  }

  /// Produces the text of a virtual `sourcemap-source:` document: the real
  /// source when it can be opened, the map's `sourcesContent` entry when
  /// not, and a diagnostic placeholder when neither works. This never
  /// fails since the result is rendered directly as document content.
  pub async fn provide_source_content(
    &self,
    specifier: &ModuleSpecifier,
    token: &CancellationToken,
  ) -> String {
    match self
      .provide_source_content_inner(
        specifier.clone(),
        token.clone(),
        Vec::new(),
      )
      .await
    {
      Ok(text) => text,
      Err(err) => invalid_source_placeholder(specifier, &err.to_string()),
    }
  }

  /// Removes the cache entries and watches for the artifact cached under
  /// `specifier`, reachable from either the map key or a document key.
  pub fn evict(&self, specifier: &ModuleSpecifier) {
    self.inner.evict(specifier);
  }

  /// Flushes all cache entries and watches. Called once at shutdown.
  pub fn dispose(&self) {
    let subscriptions =
      std::mem::take(&mut *self.inner.watches.borrow_mut());
    self.inner.by_map.borrow_mut().clear();
    self.inner.by_document.borrow_mut().clear();
    drop(subscriptions);
  }

  fn open_document_inner(
    &self,
    specifier: ModuleSpecifier,
    token: CancellationToken,
    visited: Vec<ModuleSpecifier>,
  ) -> LocalBoxFuture<'static, Result<Document, LoadError>> {
    let store = self.clone();
    Box::pin(async move {
      if token.is_cancelled() {
        return Err(LoadError::Cancelled);
      }
      match specifier.scheme() {
        INLINE_MAP_SCHEME => {
          log::debug!("{}: Reading inline sourcemap", specifier);
          let content = inline_map_text(&specifier)?;
          Ok(Document::new(specifier, content))
        }
        SOURCE_SCHEME => {
          let content = store
            .provide_source_content_inner(specifier.clone(), token, visited)
            .await?;
          Ok(Document::new(specifier, content))
        }
        "sourcemap-http" | "sourcemap-https" => {
          store.fetch_remote(specifier, token).await
        }
        _ => {
          let maybe_document = store.inner.loader.load(&specifier).await?;
          if token.is_cancelled() {
            return Err(LoadError::Cancelled);
          }
          maybe_document.ok_or(LoadError::NotFound { specifier })
        }
      }
    })
  }

  async fn fetch_remote(
    &self,
    specifier: ModuleSpecifier,
    token: CancellationToken,
  ) -> Result<Document, LoadError> {
    if !self.inner.settings.enable_http {
      return Err(LoadError::RemoteFetchDisabled { specifier });
    }
    let Some(fetcher) = &self.inner.maybe_fetcher else {
      return Err(LoadError::Other(Arc::new(JsErrorBox::generic(format!(
        "No remote fetcher is configured: {}",
        specifier
      )))));
    };
    let Some(remote_specifier) = from_remote_transport(&specifier) else {
      return Err(LoadError::NotFound { specifier });
    };
    log::info!("Fetching {}", remote_specifier);
    let maybe_document = fetcher.fetch(&remote_specifier).await?;
    if token.is_cancelled() {
      return Err(LoadError::Cancelled);
    }
    match maybe_document {
      Some(document) => Ok(Document::new(specifier, document.content)),
      None => Err(LoadError::NotFound { specifier }),
    }
  }

  fn provide_source_content_inner(
    &self,
    specifier: ModuleSpecifier,
    token: CancellationToken,
    mut visited: Vec<ModuleSpecifier>,
  ) -> LocalBoxFuture<'static, Result<String, LoadError>> {
    let store = self.clone();
    Box::pin(async move {
      log::info!("{}: Loading", specifier);
      let decoded = match decode_source_specifier(&specifier) {
        Ok(decoded) => decoded,
        Err(err) => {
          log::warn!("{}: {}", specifier, err);
          return Ok(invalid_source_placeholder(&specifier, &err.to_string()));
        }
      };
      if visited.contains(&specifier) {
        log::warn!("{}: Cyclic sourcemap source reference", specifier);
        return Ok(invalid_source_placeholder(
          &specifier,
          "Cyclic sourcemap source reference",
        ));
      }
      visited.push(specifier.clone());

      let item = match store
        .load_source_map(&decoded.map_specifier, &token)
        .await
      {
        Ok(item) => item,
        Err(err) if err.is_cancelled() => return Err(LoadError::Cancelled),
        Err(err) => {
          return Ok(source_placeholder(
            &specifier,
            &decoded.map_specifier,
            None,
            &decoded.source,
            None,
            &err.to_string(),
          ));
        }
      };
      let source_specifier = match resolve_source_specifier(
        &decoded.source,
        item.base_specifier(),
      ) {
        Ok(source_specifier) => source_specifier,
        Err(err) => {
          return Ok(source_placeholder(
            &specifier,
            item.map_specifier(),
            Some(item.base_specifier()),
            &decoded.source,
            None,
            &err.to_string(),
          ));
        }
      };
      match store
        .open_document_inner(source_specifier.clone(), token, visited)
        .await
      {
        Ok(document) => Ok(document.text().to_string()),
        Err(LoadError::Cancelled) => Err(LoadError::Cancelled),
        Err(err) => {
          if let Some(content) = item.source_content_for(&decoded.source) {
            log::info!(
              "{}: Not found. Using sourcesContent fallback from sourcemap.",
              specifier
            );
            return Ok(content.to_string());
          }
          log::warn!(
            "{}: Not found. No sourcesContent fallback in sourcemap.",
            specifier
          );
          Ok(source_placeholder(
            &specifier,
            item.map_specifier(),
            Some(item.base_specifier()),
            &decoded.source,
            Some(&source_specifier),
            &err.to_string(),
          ))
        }
      }
    })
  }

  async fn virtual_document_base(
    &self,
    specifier: &ModuleSpecifier,
    token: &CancellationToken,
  ) -> Result<ModuleSpecifier, SourceMapLoadError> {
    let decoded =
      decode_source_specifier(specifier).map_err(LoadError::from)?;
    let item = self.load_source_map(&decoded.map_specifier, token).await?;
    let source_specifier =
      resolve_source_specifier(&decoded.source, item.base_specifier())
        .map_err(|err| {
          LoadError::Other(Arc::new(JsErrorBox::generic(err.to_string())))
        })?;
    Ok(dir_specifier(&source_specifier))
  }

  async fn sibling_map_specifier(
    &self,
    specifier: &ModuleSpecifier,
  ) -> Option<ModuleSpecifier> {
    if specifier.scheme() != "file" {
      return None;
    }
    let mut sibling = specifier.clone();
    let sibling_path = format!("{}.map", sibling.path());
    sibling.set_path(&sibling_path);
    if self.inner.loader.exists(&sibling).await {
      Some(sibling)
    } else {
      None
    }
  }

  fn insert_map_entry(
    &self,
    specifier: &ModuleSpecifier,
    item: &Rc<SourceMapItem>,
  ) {
    self
      .inner
      .by_map
      .borrow_mut()
      .insert(specifier.clone(), item.clone());
    self.register_watch(specifier);
  }

  fn insert_document_entry(
    &self,
    specifier: &ModuleSpecifier,
    item: &Rc<SourceMapItem>,
  ) {
    self
      .inner
      .by_document
      .borrow_mut()
      .insert(specifier.clone(), item.clone());
    self.register_watch(specifier);
  }

  fn register_watch(&self, specifier: &ModuleSpecifier) {
    if specifier.scheme() != "file" {
      return;
    }
    let Some(watcher) = &self.inner.maybe_watcher else {
      return;
    };
    if self.inner.watches.borrow().contains_key(specifier) {
      return;
    }
    let weak = Rc::downgrade(&self.inner);
    let key = specifier.clone();
    let on_event: Box<dyn Fn()> = Box::new(move || {
      if let Some(inner) = Weak::upgrade(&weak) {
        inner.evict(&key);
      }
    });
    match watcher.watch(specifier, on_event) {
      Ok(subscription) => {
        self
          .inner
          .watches
          .borrow_mut()
          .insert(specifier.clone(), subscription);
      }
      Err(err) => {
        // the artifact stays cached, just without invalidation
        log::error!("{}: {}", specifier, err);
      }
    }
  }
}

/// Decodes the text of an inline `sourcemap:` specifier, whose path is
/// `<mime>;base64,<payload>`. The encoding and mime type are always utf-8
/// and application/json per the spec, so only the payload matters.
fn inline_map_text(
  specifier: &ModuleSpecifier,
) -> Result<String, LoadError> {
  let path = specifier.path();
  if !path.contains(',') {
    return Err(
      InvalidVirtualUriError {
        specifier: specifier.clone(),
        reason: "not a valid data uri",
      }
      .into(),
    );
  }
  let data_text = format!("data:{}", path);
  let data_url =
    DataUrl::process(&data_text).map_err(|_| InvalidVirtualUriError {
      specifier: specifier.clone(),
      reason: "cannot parse data uri",
    })?;
  let (bytes, _) =
    data_url
      .decode_to_vec()
      .map_err(|_| InvalidVirtualUriError {
        specifier: specifier.clone(),
        reason: "invalid base64 payload",
      })?;
  String::from_utf8(bytes).map_err(|_| {
    InvalidVirtualUriError {
      specifier: specifier.clone(),
      reason: "payload is not utf-8 text",
    }
    .into()
  })
}

fn source_placeholder(
  internal: &ModuleSpecifier,
  map_specifier: &ModuleSpecifier,
  maybe_base: Option<&ModuleSpecifier>,
  source: &str,
  maybe_source_specifier: Option<&ModuleSpecifier>,
  error: &str,
) -> String {
  format!(
    "/*\nCannot load source code referenced by the sourcemap.\n\n\
     Sourcemap: {}\nSourcemap relative URI: {}\nSource: {}\n\
     Source URI: {}\nInternal URI: {}\n\nError:\n{}\n*/\n",
    map_specifier,
    maybe_base.map(ModuleSpecifier::as_str).unwrap_or("(unknown)"),
    source,
    maybe_source_specifier
      .map(ModuleSpecifier::as_str)
      .unwrap_or("(unknown)"),
    internal,
    error
  )
}

fn invalid_source_placeholder(
  internal: &ModuleSpecifier,
  error: &str,
) -> String {
  format!(
    "/*\nCannot load source code referenced by the sourcemap.\n\n\
     Internal URI: {}\n\nError:\n{}\n*/\n",
    internal, error
  )
}
