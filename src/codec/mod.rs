//! Codec implementations

pub mod elic;

pub use elic::{
    BitstreamRecord, ElicConfig, ElicDecoder, ElicEncoder, ElicError, ElicModel, GroupTable,
};

/// Codec information
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodecInfo {
    /// Codec identifier
    pub id: String,
    /// Long descriptive name
    pub long_name: String,
    /// Lossy compression
    pub lossy: bool,
}

/// Get codec information by ID
pub fn get_codec_info(id: &str) -> Option<CodecInfo> {
    match id {
        elic::CODEC_ID => Some(CodecInfo {
            id: elic::CODEC_ID.to_string(),
            long_name: elic::CODEC_LONG_NAME.to_string(),
            lossy: true,
        }),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codec_info() {
        let info = get_codec_info("elic").unwrap();
        assert_eq!(info.long_name, "ELIC Learned Image Codec");
        assert!(info.lossy);
        assert!(get_codec_info("h264").is_none());
    }
}
