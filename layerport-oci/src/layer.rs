use crate::digest::Digest;
use crate::manifest::Descriptor;

/// One layer of an image, in the position the manifest lists it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerDescriptor {
    /// Content-addressable digest of the compressed blob.
    pub digest: Digest,
    /// Compressed size in bytes, as declared by the manifest.
    pub size: u64,
    /// Uncompressed size, when known.  Registries do not publish it.
    pub uncompressed_size: Option<u64>,
    /// Media type (e.g. "application/vnd.oci.image.layer.v1.tar+gzip").
    pub media_type: String,
    /// Zero-based position in the image's layer list.
    pub index: usize,
}

impl LayerDescriptor {
    pub fn from_descriptors(descriptors: &[Descriptor]) -> Vec<Self> {
        descriptors
            .iter()
            .enumerate()
            .map(|(index, d)| Self {
                digest: d.digest.clone(),
                size: d.size,
                uncompressed_size: None,
                media_type: d.media_type.clone(),
                index,
            })
            .collect()
    }
}
