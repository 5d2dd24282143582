use cache_utils::frames::{FrameError, FrameTranslator};

use crate::config::CacheGeometry;

/// Maps pages to their page color, `frame % page_colors`.
///
/// The offset inside the page selects the set within the band of sets of that color.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColorClassifier {
    colors: u64,
}

impl ColorClassifier {
    pub fn new(geometry: &CacheGeometry) -> ColorClassifier {
        ColorClassifier {
            colors: geometry.page_colors() as u64,
        }
    }

    pub fn colors(&self) -> usize {
        self.colors as usize
    }

    pub fn color_of_frame(&self, frame: u64) -> usize {
        (frame % self.colors) as usize
    }

    pub fn classify<T: FrameTranslator + ?Sized>(
        &self,
        translator: &T,
        addr: *const u8,
    ) -> Result<usize, FrameError> {
        translator
            .frame_number(addr)
            .map(|frame| self.color_of_frame(frame))
    }
}
