//! Reconciling an image's layers against what the target host already has.
//!
//! The plan keeps two views.  `full` is every layer in image order and is
//! the only list the manifest may be built from; `to_fetch` is the subset
//! whose digest the host does not know.  A manifest built from `to_fetch`
//! would declare fewer layers than the image config's `rootfs.diff_ids`,
//! which `docker load` rejects.

use std::collections::HashSet;

use layerport_oci::LayerDescriptor;
use tracing::{debug, info};

use crate::known::KnownDigests;
use crate::{Error, Result};

#[derive(Debug, Clone)]
pub struct LayerPlan {
    full: Vec<LayerDescriptor>,
    to_fetch: Vec<usize>,
    known: usize,
}

impl LayerPlan {
    /// A digest listed more than once (the shared empty layer, typically)
    /// is fetched once, at its first position, so every destination path
    /// has a single writer.
    pub fn new(layers: Vec<LayerDescriptor>, known: &KnownDigests) -> Self {
        let mut seen = HashSet::new();
        let mut to_fetch = Vec::new();
        let mut known_count = 0;
        for (i, layer) in layers.iter().enumerate() {
            if known.contains(&layer.digest) {
                known_count += 1;
            } else if seen.insert(&layer.digest) {
                to_fetch.push(i);
            } else {
                debug!(digest = %layer.digest, position = i, "repeated layer, fetched once");
            }
        }

        let plan = Self {
            full: layers,
            to_fetch,
            known: known_count,
        };
        info!(
            total = plan.full.len(),
            to_fetch = plan.to_fetch.len(),
            deduplicated = plan.deduplicated_count(),
            "layer plan ready",
        );
        plan
    }

    /// Check the plan against the layer count the image config declares.
    pub fn check_declared(&self, declared: Option<usize>) -> Result<()> {
        match declared {
            Some(n) if n != self.full.len() => Err(Error::Plan(format!(
                "layers length mismatch: manifest lists {} layers, config declares {}",
                self.full.len(),
                n
            ))),
            _ => Ok(()),
        }
    }

    /// Every layer, in image order.
    pub fn full(&self) -> &[LayerDescriptor] {
        &self.full
    }

    /// Layers that must be downloaded, in image order.
    pub fn to_fetch(&self) -> impl Iterator<Item = &LayerDescriptor> + '_ {
        self.to_fetch.iter().map(move |&i| &self.full[i])
    }

    pub fn fetch_count(&self) -> usize {
        self.to_fetch.len()
    }

    /// Layer positions whose digest the target host already has.
    pub fn deduplicated_count(&self) -> usize {
        self.known
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use layerport_oci::Digest;

    fn layers(n: usize) -> Vec<LayerDescriptor> {
        (0..n)
            .map(|i| LayerDescriptor {
                digest: Digest::parse(&format!("sha256:{:064x}", i + 1)).unwrap(),
                size: 100 + i as u64,
                uncompressed_size: None,
                media_type: "application/vnd.oci.image.layer.v1.tar+gzip".into(),
                index: i,
            })
            .collect()
    }

    #[test]
    fn twenty_five_layers_ten_known() {
        let all = layers(25);
        let known: KnownDigests = all
            .iter()
            .step_by(2)
            .take(10)
            .map(|l| l.digest.clone())
            .collect();

        let plan = LayerPlan::new(all.clone(), &known);

        assert_eq!(plan.full().len(), 25);
        assert_eq!(plan.fetch_count(), 15);
        assert_eq!(plan.deduplicated_count(), 10);
        assert_eq!(plan.full(), all.as_slice());

        let fetched: Vec<&LayerDescriptor> = plan.to_fetch().collect();
        assert!(fetched.iter().all(|l| all.contains(l)));
        assert!(fetched.iter().all(|l| !known.contains(&l.digest)));
        assert!(fetched.windows(2).all(|w| w[0].index < w[1].index));
    }

    #[test]
    fn everything_known_still_keeps_full_list() {
        let all = layers(3);
        let known: KnownDigests = all.iter().map(|l| l.digest.clone()).collect();
        let plan = LayerPlan::new(all, &known);
        assert_eq!(plan.full().len(), 3);
        assert_eq!(plan.fetch_count(), 0);
    }

    #[test]
    fn repeated_digest_is_fetched_once() {
        let mut all = layers(4);
        all[3].digest = all[1].digest.clone();
        let plan = LayerPlan::new(all, &KnownDigests::new());

        assert_eq!(plan.full().len(), 4);
        let indices: Vec<usize> = plan.to_fetch().map(|l| l.index).collect();
        assert_eq!(indices, vec![0, 1, 2]);
        assert_eq!(plan.deduplicated_count(), 0);
        plan.check_declared(Some(4)).unwrap();
    }

    #[test]
    fn declared_count_must_match() {
        let plan = LayerPlan::new(layers(4), &KnownDigests::new());
        plan.check_declared(Some(4)).unwrap();
        plan.check_declared(None).unwrap();
        let err = plan.check_declared(Some(3)).unwrap_err();
        assert!(err.to_string().contains("layers length mismatch"));
    }
}
