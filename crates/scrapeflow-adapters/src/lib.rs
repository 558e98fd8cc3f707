pub mod fetch;
pub mod html;
pub mod rate_limit;

pub use fetch::{FileFetcher, HttpFetcher, RoutingFetcher};
pub use html::HtmlParser;
pub use rate_limit::TokenBucket;
