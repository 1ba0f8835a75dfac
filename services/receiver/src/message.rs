//! Wire message types sent by the camera.
//!
//! These mirror `proto/picam.proto` and are decoded with prost directly, so no
//! protoc is needed at build time.

/// Capture metadata attached to every image.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ImageMetadata {
    /// Whole seconds since the Unix epoch
    #[prost(int64, tag = "1")]
    pub time_s: i64,
    /// Microsecond part of the capture time
    #[prost(int64, tag = "2")]
    pub time_us: i64,
    /// Image width in pixels
    #[prost(uint32, tag = "3")]
    pub width: u32,
    /// Image height in pixels
    #[prost(uint32, tag = "4")]
    pub height: u32,
}

/// One still image as sent by the camera.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ImageMessage {
    #[prost(message, optional, tag = "1")]
    pub metadata: ::core::option::Option<ImageMetadata>,
    /// Encoded image bytes
    #[prost(bytes = "vec", optional, tag = "2")]
    pub data: ::core::option::Option<::prost::alloc::vec::Vec<u8>>,
}
