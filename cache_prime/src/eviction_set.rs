use cache_utils::frames::FrameTranslator;
use log::{debug, info, warn};

use crate::classifier::ColorClassifier;
use crate::config::CacheGeometry;
use crate::pool::{MemoryPool, PageHandle};
use crate::PrimeError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvictionSet {
    geometry: CacheGeometry,
    colors: Vec<Vec<PageHandle>>,
}

impl EvictionSet {
    /// Classify the pool pages in enumeration order, keeping the first `ways` of each color.
    pub fn build<T: FrameTranslator + ?Sized>(
        geometry: &CacheGeometry,
        classifier: &ColorClassifier,
        pool: &MemoryPool,
        translator: &T,
    ) -> Result<EvictionSet, PrimeError> {
        let ways = geometry.ways();
        let mut colors: Vec<Vec<PageHandle>> = (0..classifier.colors())
            .map(|_| Vec::with_capacity(ways))
            .collect();
        let mut full = 0;
        let mut classified = 0;
        for page in pool.pages() {
            if full == colors.len() {
                break;
            }
            let color = classifier.classify(translator, pool.page_ptr(page))?;
            classified += 1;
            let slot = &mut colors[color];
            if slot.len() < ways {
                slot.push(page);
                if slot.len() == ways {
                    full += 1;
                }
            }
        }
        debug!(
            "classified {} of {} pages, {} of {} colors full",
            classified,
            pool.page_count(),
            full,
            colors.len()
        );
        if let Some((color, pages)) = colors.iter().enumerate().find(|(_, p)| p.len() < ways) {
            return Err(PrimeError::UnderfilledSet {
                color,
                filled: pages.len(),
                ways,
            });
        }
        info!(
            "eviction set built: {} colors x {} ways, {} sets",
            colors.len(),
            ways,
            geometry.set_count()
        );
        Ok(EvictionSet {
            geometry: *geometry,
            colors,
        })
    }

    pub fn geometry(&self) -> &CacheGeometry {
        &self.geometry
    }

    pub fn colors(&self) -> usize {
        self.colors.len()
    }

    pub fn color_pages(&self, color: usize) -> &[PageHandle] {
        &self.colors[color]
    }

    /// Number of addresses held for cache set `set`.
    pub fn set_len(&self, set: usize) -> usize {
        let (color, _) = self.geometry.locate_set(set);
        self.colors[color].len()
    }

    /// The addresses that compete for cache set `set`, one per way.
    pub fn set_lines<'a>(
        &'a self,
        pool: &'a MemoryPool,
        set: usize,
    ) -> impl Iterator<Item = *const u8> + 'a {
        let (color, line) = self.geometry.locate_set(set);
        let offset = line * self.geometry.line_size();
        self.colors[color]
            .iter()
            .map(move |page| pool.line_ptr(*page, offset))
    }

    /// Re-classify every stored page. A single mismatch fails the whole set.
    pub fn check<T: FrameTranslator + ?Sized>(
        &self,
        classifier: &ColorClassifier,
        pool: &MemoryPool,
        translator: &T,
    ) -> bool {
        self.colors.iter().enumerate().all(|(color, pages)| {
            pages.iter().enumerate().all(|(way, page)| {
                match classifier.classify(translator, pool.page_ptr(*page)) {
                    Ok(c) if c == color => true,
                    Ok(c) => {
                        warn!("color {} way {} now classifies as color {}", color, way, c);
                        false
                    }
                    Err(e) => {
                        warn!("color {} way {} cannot be classified: {}", color, way, e);
                        false
                    }
                }
            })
        })
    }

    pub fn validate<'a, T: FrameTranslator + ?Sized>(
        &'a self,
        classifier: &ColorClassifier,
        pool: &'a MemoryPool,
        translator: &T,
    ) -> Result<ValidatedSet<'a>, PrimeError> {
        if self.check(classifier, pool, translator) {
            Ok(ValidatedSet { set: self, pool })
        } else {
            Err(PrimeError::Validation)
        }
    }
}

/// Proof that an eviction set passed validation against `pool`; the only way to
/// feed the scanner, and consumed by it.
#[derive(Debug)]
pub struct ValidatedSet<'a> {
    set: &'a EvictionSet,
    pool: &'a MemoryPool,
}

impl<'a> ValidatedSet<'a> {
    pub fn eviction_set(&self) -> &'a EvictionSet {
        self.set
    }

    pub fn pool(&self) -> &'a MemoryPool {
        self.pool
    }
}
