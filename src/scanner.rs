// Copyright 2018-2024 the Deno authors. MIT license.

use std::fmt;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use serde::Serialize;

use crate::source::Document;
use crate::uri::classify_reference;
use crate::uri::file_specifier_from_path;
use crate::uri::join_path;
use crate::uri::to_inline_transport;
use crate::uri::to_remote_transport;
use crate::uri::ModuleSpecifier;
use crate::uri::ReferenceKind;

/// Only the trailing lines of a generated document are scanned for the
/// sourceMappingURL magic comment.
pub const SCAN_LINE_COUNT: usize = 10;

static SOURCE_MAPPING_RE: Lazy<Regex> = Lazy::new(|| {
  Regex::new(r"^(//[#@] ?sourceMappingURL\s*=\s*)(.+)$").unwrap()
});

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Hash)]
pub struct Position {
  /// The 0-indexed line index.
  pub line: usize,
  /// The 0-indexed character index.
  pub character: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Hash)]
pub struct Range {
  pub specifier: ModuleSpecifier,
  pub start: Position,
  pub end: Position,
}

impl fmt::Display for Range {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(
      f,
      "{}:{}:{}",
      self.specifier,
      self.start.line + 1,
      self.start.character + 1
    )
  }
}

/// The scanned sourceMappingURL reference of a generated document: the
/// range of the reference text, for link affordances, and the absolute
/// specifier it resolves to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceMapLink {
  pub range: Range,
  pub target: ModuleSpecifier,
}

/// Scans the last [`SCAN_LINE_COUNT`] lines of a document, from the last
/// line backward, for a sourceMappingURL reference and resolves it against
/// `document_base` (the document's directory). The match closest to the end
/// of the file wins.
pub fn scan(
  document: &Document,
  document_base: &ModuleSpecifier,
) -> Option<SourceMapLink> {
  let lines = document.lines();
  let first_line = lines.len().saturating_sub(SCAN_LINE_COUNT);
  for line_index in (first_line..lines.len()).rev() {
    let Some(captures) = SOURCE_MAPPING_RE.captures(lines[line_index]) else {
      continue;
    };
    let prefix_len = captures.get(1).unwrap().as_str().len();
    let reference = captures.get(2).unwrap().as_str().trim();
    let Some(target) = resolve_reference(reference, document_base) else {
      log::debug!(
        "{}: ignoring unparsable sourceMappingURL \"{}\"",
        document.specifier,
        reference
      );
      return None;
    };
    return Some(SourceMapLink {
      range: Range {
        specifier: document.specifier.clone(),
        start: Position {
          line: line_index,
          character: prefix_len,
        },
        end: Position {
          line: line_index,
          character: prefix_len + reference.len(),
        },
      },
      target,
    });
  }
  None
}

/// Resolves a raw sourceMappingURL reference to an absolute specifier.
/// Scheme-qualified references are transport-translated (`http`/`https` to
/// the remote passthrough form, `data` to the inline form carrying
/// `document_base`), absolute paths become `file:` specifiers, and
/// everything else joins onto `document_base`.
pub fn resolve_reference(
  reference: &str,
  document_base: &ModuleSpecifier,
) -> Option<ModuleSpecifier> {
  match classify_reference(reference) {
    ReferenceKind::Scheme => {
      let specifier = ModuleSpecifier::parse(reference).ok()?;
      let specifier = to_remote_transport(specifier);
      Some(to_inline_transport(specifier, document_base))
    }
    ReferenceKind::WindowsAbsolutePath | ReferenceKind::AbsolutePath => {
      file_specifier_from_path(reference).ok()
    }
    ReferenceKind::RelativePath => join_path(document_base, reference).ok(),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::uri::dir_specifier;
  use pretty_assertions::assert_eq;

  fn doc(text: &str) -> Document {
    Document::new(
      ModuleSpecifier::parse("file:///proj/out/min.js").unwrap(),
      text,
    )
  }

  fn scan_text(text: &str) -> Option<SourceMapLink> {
    let document = doc(text);
    let base = dir_specifier(&document.specifier);
    scan(&document, &base)
  }

  #[test]
  fn test_scan_relative_reference() {
    let link =
      scan_text("var a=1;\n//# sourceMappingURL=min.js.map").unwrap();
    assert_eq!(
      link.target,
      ModuleSpecifier::parse("file:///proj/out/min.js.map").unwrap()
    );
    assert_eq!(link.range.start, Position { line: 1, character: 21 });
    assert_eq!(link.range.end, Position { line: 1, character: 31 });
  }

  #[test]
  fn test_scan_at_reference_and_whitespace() {
    let link =
      scan_text("var a=1;\n//@ sourceMappingURL = min.js.map ").unwrap();
    assert_eq!(
      link.target,
      ModuleSpecifier::parse("file:///proj/out/min.js.map").unwrap()
    );
  }

  #[test]
  fn test_scan_absolute_and_windows_references() {
    let link = scan_text("//# sourceMappingURL=/maps/min.js.map").unwrap();
    assert_eq!(
      link.target,
      ModuleSpecifier::parse("file:///maps/min.js.map").unwrap()
    );

    let link =
      scan_text("//# sourceMappingURL=C:\\maps\\min.js.map").unwrap();
    assert_eq!(
      link.target,
      ModuleSpecifier::parse("file:///C:/maps/min.js.map").unwrap()
    );
  }

  #[test]
  fn test_scan_http_reference() {
    let link =
      scan_text("//# sourceMappingURL=https://example.com/min.js.map")
        .unwrap();
    assert_eq!(
      link.target,
      ModuleSpecifier::parse("sourcemap-https://example.com/min.js.map")
        .unwrap()
    );
  }

  #[test]
  fn test_scan_data_reference_uses_document_base() {
    let link = scan_text(
      "//# sourceMappingURL=data:application/json;base64,eyJ2ZXJzaW9uIjozfQ==",
    )
    .unwrap();
    assert_eq!(link.target.scheme(), "sourcemap");
    assert_eq!(link.target.fragment(), Some("file:///proj/out"));
  }

  #[test]
  fn test_scan_window() {
    // nine trailing lines after the reference is still a hit
    let text =
      format!("//# sourceMappingURL=min.js.map{}", "\nvar x=1;".repeat(9));
    assert!(scan_text(&text).is_some());

    // ten pushes the reference out of the window
    let text =
      format!("//# sourceMappingURL=min.js.map{}", "\nvar x=1;".repeat(10));
    assert_eq!(scan_text(&text), None);
  }

  #[test]
  fn test_scan_closest_to_end_wins() {
    let link = scan_text(
      "//# sourceMappingURL=first.js.map\n//# sourceMappingURL=second.js.map",
    )
    .unwrap();
    assert_eq!(
      link.target,
      ModuleSpecifier::parse("file:///proj/out/second.js.map").unwrap()
    );
  }

  #[test]
  fn test_scan_requires_comment_at_line_start() {
    assert_eq!(scan_text("var a=1; //# sourceMappingURL=min.js.map"), None);
    assert_eq!(scan_text("//# sourcemappingurl=min.js.map"), None);
  }
}
