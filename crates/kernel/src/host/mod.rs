//! Capability bindings exposed to extension code.
//!
//! Each binding family lives in its own module and is surfaced to the
//! scripting engine as one global object. I/O-bound bindings take the
//! gate and manifest at construction so every call is authorized before
//! it touches the filesystem, the network, or a subprocess.

mod abort;
mod app;
mod archives;
mod crypto;
mod fetch;
mod form_data;
pub mod fs;
mod mime;
mod os;
mod scanner_utils;

pub use abort::{AbortContext, AbortSignal};
pub use app::AppBinding;
pub use archives::ArchiveBinding;
pub use crypto::{decrypt, encrypt, Encoding};
pub use fetch::{FetchBody, FetchClient, FetchOptions, FetchResponse, MAX_CONCURRENT_FETCHES};
pub use form_data::FormData;
pub use fs::FsBinding;
pub use mime::{format_media_type, parse_media_type, MediaType};
pub use os::{CmdEvent, CmdHandle, CmdLine, DirEntry, FileStat, OsBinding};
pub use scanner_utils::{
    build_advanced_query, build_part_query, build_search_query, build_season_query,
    build_smart_search_titles, compare_titles, extract_part_number, extract_season_number,
    extract_year, find_best_match, get_significant_tokens, normalize_title, sanitize_query,
    NormalizedTitle, SmartSearchTitles,
};
