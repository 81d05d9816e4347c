// Copyright 2018-2024 the Deno authors. MIT license.

use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;
use url::form_urlencoded;
use url::Url;

pub type ModuleSpecifier = Url;

/// Scheme of the internal specifier an inline (`data:`) source map reference
/// is rewritten to. The payload stays in the path and the generated
/// document's base directory travels in the fragment.
pub const INLINE_MAP_SCHEME: &str = "sourcemap";
/// Scheme of a virtual specifier identifying "source `s` as referenced by
/// map `sm`", used when the real source file cannot be opened directly.
pub const SOURCE_SCHEME: &str = "sourcemap-source";
/// Prefix prepended to `http`/`https` so remote content is routed through
/// the remote-fetch collaborator instead of any native scheme handling.
pub const REMOTE_SCHEME_PREFIX: &str = "sourcemap-";

// RFC 3986 allows single-letter schemes, but those collide with Windows
// drive letters, so the scheme pattern requires 2+ characters after the
// first letter.
static SCHEME_RE: Lazy<Regex> =
  Lazy::new(|| Regex::new(r"^[a-zA-Z][a-zA-Z0-9+\-.]+:").unwrap());
static WINDOWS_ABS_RE: Lazy<Regex> =
  Lazy::new(|| Regex::new(r"^[a-zA-Z]:[\\/]").unwrap());
static ABS_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[\\/]").unwrap());

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReferenceKind {
  /// A scheme-qualified reference (ex. `https://example.com/a.js.map`).
  Scheme,
  /// A Windows absolute path (ex. `C:\out\a.js.map`).
  WindowsAbsolutePath,
  /// A leading-slash or leading-backslash absolute path.
  AbsolutePath,
  /// Anything else, resolved against the referencing document's directory.
  RelativePath,
}

pub fn classify_reference(text: &str) -> ReferenceKind {
  if SCHEME_RE.is_match(text) {
    ReferenceKind::Scheme
  } else if WINDOWS_ABS_RE.is_match(text) {
    ReferenceKind::WindowsAbsolutePath
  } else if ABS_RE.is_match(text) {
    ReferenceKind::AbsolutePath
  } else {
    ReferenceKind::RelativePath
  }
}

pub fn has_uri_scheme(text: &str) -> bool {
  SCHEME_RE.is_match(text)
}

#[derive(Debug, Clone, Error, deno_error::JsError)]
#[class(type)]
#[error("Invalid virtual source map uri \"{specifier}\": {reason}")]
pub struct InvalidVirtualUriError {
  pub specifier: ModuleSpecifier,
  pub reason: &'static str,
}

/// Rewrites an `http:`/`https:` specifier to the internal
/// `sourcemap-http:`/`sourcemap-https:` transport form. Other specifiers
/// are returned unchanged.
pub fn to_remote_transport(specifier: ModuleSpecifier) -> ModuleSpecifier {
  match specifier.scheme() {
    "http" | "https" => {
      Url::parse(&format!("{}{}", REMOTE_SCHEME_PREFIX, specifier))
        .unwrap_or(specifier)
    }
    _ => specifier,
  }
}

/// Strips the internal transport prefix off a `sourcemap-http:`/
/// `sourcemap-https:` specifier, returning the real remote url.
pub fn from_remote_transport(
  specifier: &ModuleSpecifier,
) -> Option<ModuleSpecifier> {
  if !matches!(specifier.scheme(), "sourcemap-http" | "sourcemap-https") {
    return None;
  }
  let text = specifier.as_str().strip_prefix(REMOTE_SCHEME_PREFIX)?;
  Url::parse(text).ok()
}

/// Rewrites a `data:` specifier to the internal `sourcemap:` form. A data
/// uri carries no location of its own, so the generated document's base
/// directory is attached as the fragment for later source resolution.
pub fn to_inline_transport(
  specifier: ModuleSpecifier,
  document_base: &ModuleSpecifier,
) -> ModuleSpecifier {
  if specifier.scheme() != "data" {
    return specifier;
  }
  match Url::parse(&format!("{}:{}", INLINE_MAP_SCHEME, specifier.path())) {
    Ok(mut inline) => {
      inline.set_fragment(Some(document_base.as_str()));
      inline
    }
    Err(_) => specifier,
  }
}

/// The directory used to resolve a map's relative `sources` entries. For an
/// inline `sourcemap:` specifier this is the attached fragment (the
/// generated document's directory); otherwise the map's parent directory.
pub fn map_base_specifier(
  map_specifier: &ModuleSpecifier,
) -> Result<ModuleSpecifier, InvalidVirtualUriError> {
  if map_specifier.scheme() == INLINE_MAP_SCHEME {
    let fragment =
      map_specifier
        .fragment()
        .ok_or_else(|| InvalidVirtualUriError {
          specifier: map_specifier.clone(),
          reason: "missing base directory fragment",
        })?;
    Url::parse(fragment).map_err(|_| InvalidVirtualUriError {
      specifier: map_specifier.clone(),
      reason: "base directory fragment is not a valid uri",
    })
  } else {
    Ok(dir_specifier(map_specifier))
  }
}

/// Trims the filename part off the specifier's path, keeping everything
/// else intact.
pub fn dir_specifier(specifier: &ModuleSpecifier) -> ModuleSpecifier {
  let mut result = specifier.clone();
  let path = result.path();
  let end = match path.rfind('/') {
    Some(0) => 1,
    Some(index) => index,
    None => return result,
  };
  let dir_path = path[..end].to_string();
  result.set_path(&dir_path);
  result
}

/// Appends a relative path onto a directory specifier, normalizing `.` and
/// `..` segments.
pub fn join_path(
  base: &ModuleSpecifier,
  relative: &str,
) -> Result<ModuleSpecifier, url::ParseError> {
  let mut dir = base.clone();
  if !dir.path().ends_with('/') {
    let dir_path = format!("{}/", dir.path());
    dir.set_path(&dir_path);
  }
  dir.join(relative)
}

/// Interprets an absolute or Windows-style path reference as a `file:`
/// specifier.
pub fn file_specifier_from_path(
  path: &str,
) -> Result<ModuleSpecifier, url::ParseError> {
  let path = path.replace('\\', "/");
  if path.starts_with('/') {
    Url::parse(&format!("file://{}", path))
  } else {
    Url::parse(&format!("file:///{}", path))
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceMapSourceSpecifier {
  /// The specifier of the map that references the source.
  pub map_specifier: ModuleSpecifier,
  /// The map's `source` field, verbatim.
  pub source: String,
  /// Cosmetic display path. Never part of identity.
  pub path: String,
}

/// Encodes "source `source` as referenced by map `map_specifier`" into a
/// single `sourcemap-source:` specifier, with the identifying parts in the
/// query and a cosmetic display path.
pub fn encode_source_specifier(
  map_specifier: &ModuleSpecifier,
  source: &str,
) -> ModuleSpecifier {
  let query = form_urlencoded::Serializer::new(String::new())
    .append_pair("sm", map_specifier.as_str())
    .append_pair("s", source)
    .finish();
  let display_path = if has_uri_scheme(source) {
    Url::parse(source)
      .map(|url| url.path().to_string())
      .unwrap_or_else(|_| source.to_string())
  } else {
    source.to_string()
  };
  let display_path = display_path.replace('?', "%3F").replace('#', "%23");
  Url::parse(&format!("{}:{}?{}", SOURCE_SCHEME, display_path, query))
    .unwrap_or_else(|_| {
      // the query is form-urlencoded, so a specifier with a plain path
      // always parses
      Url::parse(&format!("{}:source?{}", SOURCE_SCHEME, query)).unwrap()
    })
}

/// Decodes a specifier produced by [`encode_source_specifier`].
pub fn decode_source_specifier(
  specifier: &ModuleSpecifier,
) -> Result<SourceMapSourceSpecifier, InvalidVirtualUriError> {
  if specifier.scheme() != SOURCE_SCHEME {
    return Err(InvalidVirtualUriError {
      specifier: specifier.clone(),
      reason: "expected a sourcemap-source scheme",
    });
  }
  let mut maybe_map = None;
  let mut maybe_source = None;
  for (key, value) in specifier.query_pairs() {
    match key.as_ref() {
      "sm" => maybe_map = Some(value.into_owned()),
      "s" => maybe_source = Some(value.into_owned()),
      _ => {}
    }
  }
  let map_text = maybe_map.ok_or(InvalidVirtualUriError {
    specifier: specifier.clone(),
    reason: "missing \"sm\" query part",
  })?;
  let source = maybe_source.ok_or(InvalidVirtualUriError {
    specifier: specifier.clone(),
    reason: "missing \"s\" query part",
  })?;
  let map_specifier =
    Url::parse(&map_text).map_err(|_| InvalidVirtualUriError {
      specifier: specifier.clone(),
      reason: "\"sm\" query part is not a valid uri",
    })?;
  Ok(SourceMapSourceSpecifier {
    map_specifier,
    source,
    path: specifier.path().to_string(),
  })
}

/// Resolves a map's `source` field to a full specifier. Scheme-qualified
/// sources are transport-translated, everything else joins onto the map's
/// base directory.
pub fn resolve_source_specifier(
  source: &str,
  map_base: &ModuleSpecifier,
) -> Result<ModuleSpecifier, url::ParseError> {
  if has_uri_scheme(source) {
    Ok(to_remote_transport(Url::parse(source)?))
  } else {
    join_path(map_base, source)
  }
}
