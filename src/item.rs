// Copyright 2018-2024 the Deno authors. MIT license.

use std::fmt;

use serde_json::Value;
use sourcemap::SourceMap;
use sourcemap::Token;
use thiserror::Error;

use crate::uri::ModuleSpecifier;

#[derive(Debug, Error, deno_error::JsError)]
pub enum SourceMapParseError {
  #[class(type)]
  #[error("Source map is not valid JSON: {0}")]
  Json(#[from] serde_json::Error),
  #[class(type)]
  #[error("Failed decoding source map: {0}")]
  Decode(#[from] sourcemap::Error),
}

/// Tie-break applied when a generated position falls between two mapped
/// positions.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum Bias {
  /// The mapped position closest before the queried position.
  #[default]
  GreatestLowerBound,
  /// The mapped position closest after the queried position.
  LeastUpperBound,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OriginalPosition {
  /// The map's `source` field for the mapped position.
  pub source: String,
  /// The 1-indexed line in the original source.
  pub line: u32,
  /// The 0-indexed column in the original source.
  pub column: u32,
  pub maybe_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedPosition {
  /// The 1-indexed line in the generated document.
  pub line: u32,
  /// The 0-indexed column in the generated document.
  pub column: u32,
}

/// A parsed, immutable source map plus its resolution metadata. A changed
/// backing file evicts the whole item from the store rather than mutating
/// it.
pub struct SourceMapItem {
  raw_map: Value,
  map: SourceMap,
  map_specifier: ModuleSpecifier,
  base_specifier: ModuleSpecifier,
}

impl fmt::Debug for SourceMapItem {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("SourceMapItem")
      .field("map_specifier", &self.map_specifier)
      .field("base_specifier", &self.base_specifier)
      .finish()
  }
}

impl SourceMapItem {
  /// Parses the JSON text of a source map.
  ///
  /// `map_specifier` identifies the map and `base_specifier` is the
  /// directory its relative `sources` entries resolve against.
  pub fn from_slice(
    data: &[u8],
    map_specifier: ModuleSpecifier,
    base_specifier: ModuleSpecifier,
  ) -> Result<Self, SourceMapParseError> {
    let raw_map: Value = serde_json::from_slice(data)?;
    let map = SourceMap::from_slice(data)?;
    Ok(Self {
      raw_map,
      map,
      map_specifier,
      base_specifier,
    })
  }

  /// The raw JSON source map object.
  pub fn raw_map(&self) -> &Value {
    &self.raw_map
  }

  pub fn map_specifier(&self) -> &ModuleSpecifier {
    &self.map_specifier
  }

  pub fn base_specifier(&self) -> &ModuleSpecifier {
    &self.base_specifier
  }

  /// The map's `sources` entries.
  pub fn sources(&self) -> impl Iterator<Item = &str> {
    self.map.sources()
  }

  /// Maps a position in the generated document to the original source
  /// position it came from, or `None` when the generated line holds no
  /// mapping.
  ///
  /// `line` is 1-indexed and `column` 0-indexed, matching the common
  /// consumer convention.
  pub fn original_position_for(
    &self,
    line: u32,
    column: u32,
    bias: Bias,
  ) -> Option<OriginalPosition> {
    let line_index = line.checked_sub(1)?;
    let token = match bias {
      Bias::GreatestLowerBound => self.map.lookup_token(line_index, column),
      Bias::LeastUpperBound => {
        self.least_upper_bound_token(line_index, column)
      }
    }?;
    // a token from another generated line is no mapping at all
    if token.get_dst_line() != line_index {
      return None;
    }
    let source = token.get_source()?;
    Some(OriginalPosition {
      source: source.to_string(),
      line: token.get_src_line() + 1,
      column: token.get_src_col(),
      maybe_name: token.get_name().map(str::to_string),
    })
  }

  /// Maps a position in an original source back to the generated document.
  /// Prefers the nearest mapped position at or after the query, falling
  /// back to the nearest one before it.
  pub fn generated_position_for(
    &self,
    source: &str,
    line: u32,
    column: u32,
  ) -> Option<GeneratedPosition> {
    let line_index = line.checked_sub(1)?;
    let mut maybe_following: Option<Token> = None;
    let mut maybe_preceding: Option<Token> = None;
    for token in self.map.tokens() {
      if token.get_source() != Some(source) {
        continue;
      }
      let position = (token.get_src_line(), token.get_src_col());
      if position >= (line_index, column) {
        if maybe_following.map_or(true, |best| {
          position < (best.get_src_line(), best.get_src_col())
        }) {
          maybe_following = Some(token);
        }
      } else if maybe_preceding.map_or(true, |best| {
        position > (best.get_src_line(), best.get_src_col())
      }) {
        maybe_preceding = Some(token);
      }
    }
    let token = maybe_following.or(maybe_preceding)?;
    Some(GeneratedPosition {
      line: token.get_dst_line() + 1,
      column: token.get_dst_col(),
    })
  }

  /// The embedded `sourcesContent` entry for a `source` field, if the map
  /// carries one.
  pub fn source_content_for(&self, source: &str) -> Option<&str> {
    let index = self.map.sources().position(|name| name == source)?;
    self.map.get_source_contents(index as u32)
  }

  fn least_upper_bound_token(
    &self,
    line_index: u32,
    column: u32,
  ) -> Option<Token> {
    let mut maybe_best: Option<Token> = None;
    for token in self.map.tokens() {
      let position = (token.get_dst_line(), token.get_dst_col());
      if position < (line_index, column) {
        continue;
      }
      if maybe_best.map_or(true, |best| {
        position < (best.get_dst_line(), best.get_dst_col())
      }) {
        maybe_best = Some(token);
      }
    }
    maybe_best
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use pretty_assertions::assert_eq;

  // three tokens: generated 1:0 -> one.js 1:0, generated 1:10 -> one.js
  // 1:10, generated 2:0 -> one.js 2:0
  const MAP: &str = r#"{
    "version": 3,
    "file": "min.js",
    "sources": ["one.js"],
    "sourcesContent": ["console.log(1)"],
    "names": [],
    "mappings": "AAAA,UAAU;AACV"
  }"#;

  fn item() -> SourceMapItem {
    SourceMapItem::from_slice(
      MAP.as_bytes(),
      ModuleSpecifier::parse("file:///proj/min.js.map").unwrap(),
      ModuleSpecifier::parse("file:///proj").unwrap(),
    )
    .unwrap()
  }

  #[test]
  fn test_original_position_for_exact() {
    let item = item();
    let position = item
      .original_position_for(1, 10, Bias::GreatestLowerBound)
      .unwrap();
    assert_eq!(
      position,
      OriginalPosition {
        source: "one.js".to_string(),
        line: 1,
        column: 10,
        maybe_name: None,
      }
    );
  }

  #[test]
  fn test_original_position_for_bias() {
    let item = item();
    let preceding = item
      .original_position_for(1, 5, Bias::GreatestLowerBound)
      .unwrap();
    assert_eq!((preceding.line, preceding.column), (1, 0));

    let following = item
      .original_position_for(1, 5, Bias::LeastUpperBound)
      .unwrap();
    assert_eq!((following.line, following.column), (1, 10));
  }

  #[test]
  fn test_original_position_for_unmapped() {
    let item = item();
    assert_eq!(item.original_position_for(9, 0, Bias::default()), None);
    assert_eq!(
      item.original_position_for(9, 0, Bias::LeastUpperBound),
      None
    );
  }

  #[test]
  fn test_generated_position_for() {
    let item = item();
    let position = item.generated_position_for("one.js", 1, 10).unwrap();
    assert_eq!(position, GeneratedPosition { line: 1, column: 10 });

    let position = item.generated_position_for("one.js", 1, 3).unwrap();
    assert_eq!(position, GeneratedPosition { line: 1, column: 10 });

    assert_eq!(item.generated_position_for("missing.js", 1, 0), None);
  }

  #[test]
  fn test_source_content_for() {
    let item = item();
    assert_eq!(item.source_content_for("one.js"), Some("console.log(1)"));
    assert_eq!(item.source_content_for("missing.js"), None);
  }

  #[test]
  fn test_from_slice_rejects_invalid_json() {
    let err = SourceMapItem::from_slice(
      b"not json",
      ModuleSpecifier::parse("file:///proj/min.js.map").unwrap(),
      ModuleSpecifier::parse("file:///proj").unwrap(),
    )
    .unwrap_err();
    assert!(matches!(err, SourceMapParseError::Json(_)));
  }
}
