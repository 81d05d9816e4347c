// Copyright 2018-2024 the Deno authors. MIT license.

#![deny(clippy::print_stderr)]
#![deny(clippy::print_stdout)]

mod item;
mod scanner;
mod settings;
pub mod source;
mod store;
pub mod uri;

pub use item::Bias;
pub use item::GeneratedPosition;
pub use item::OriginalPosition;
pub use item::SourceMapItem;
pub use item::SourceMapParseError;
pub use scanner::scan;
pub use scanner::Position;
pub use scanner::Range;
pub use scanner::SourceMapLink;
pub use scanner::SCAN_LINE_COUNT;
pub use settings::Settings;
pub use store::ResolveSourceMapError;
pub use store::SourceMapLoadError;
pub use store::SourceMapStore;
pub use store::SourceMapStoreOptions;
pub use uri::InvalidVirtualUriError;
pub use uri::ModuleSpecifier;
