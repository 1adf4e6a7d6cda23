//! Portal-facing adapters: the source client, the record normalizer and the
//! detail page extractor.

pub mod detail;
pub mod normalize;
pub mod source;

pub use detail::{extract_detail, DetailExtraction, ExtractError, ExtractionPass};
pub use normalize::{normalize, normalize_item, passthrough, NormalizeError};
pub use source::{
    extract_token, unwrap_envelope, Endpoint, PortalClient, PortalClientConfig, PortalContext,
    PortalSource, SourceError,
};

pub const CRATE_NAME: &str = "rupsync-adapters";
