mod http;

pub use http::HttpBucketAccess;
