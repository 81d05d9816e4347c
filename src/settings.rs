// Copyright 2018-2024 the Deno authors. MIT license.

use serde::Deserialize;
use serde::Serialize;

/// Configuration for the store, typically sourced from the host editor's
/// settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
  /// Permits fetching `sourcemap-http:`/`sourcemap-https:` content over
  /// the network. When disabled such loads fail instead of reaching out.
  pub enable_http: bool,
}

impl Default for Settings {
  fn default() -> Self {
    Self { enable_http: false }
  }
}
