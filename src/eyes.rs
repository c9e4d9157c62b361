use base64::Engine as _;
use image::RgbaImage;

use crate::errors::UnsubResult;

/// A captured frame: the encoded PNG sent to the model plus its decoded
/// pixels used for change detection.
pub struct Screenshot {
    pub png: Vec<u8>,
    pub pixels: RgbaImage,
}

impl Screenshot {
    pub fn from_png(png: Vec<u8>) -> UnsubResult<Self> {
        let pixels = image::load_from_memory(&png)?.to_rgba8();
        Ok(Self { png, pixels })
    }

    pub fn data_uri(&self) -> String {
        png_data_uri(&self.png)
    }
}

/// True when both frames have the same size and no pixel differs.
pub fn is_unchanged(previous: &RgbaImage, current: &RgbaImage) -> bool {
    previous.dimensions() == current.dimensions() && previous.as_raw() == current.as_raw()
}

pub fn png_data_uri(png: &[u8]) -> String {
    format!(
        "data:image/png;base64,{}",
        base64::engine::general_purpose::STANDARD.encode(png)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgba;

    fn solid(w: u32, h: u32) -> RgbaImage {
        RgbaImage::from_pixel(w, h, Rgba([255, 255, 255, 255]))
    }

    #[test]
    fn identical_frames_are_unchanged() {
        assert!(is_unchanged(&solid(8, 8), &solid(8, 8)));
    }

    #[test]
    fn one_pixel_is_a_change() {
        let mut current = solid(8, 8);
        current.put_pixel(3, 5, Rgba([254, 255, 255, 255]));
        assert!(!is_unchanged(&solid(8, 8), &current));
    }

    #[test]
    fn resized_viewport_counts_as_changed() {
        assert!(!is_unchanged(&solid(8, 8), &solid(8, 9)));
    }

    #[test]
    fn png_round_trips_through_screenshot() {
        let mut png = Vec::new();
        image::DynamicImage::ImageRgba8(solid(2, 2))
            .write_to(&mut std::io::Cursor::new(&mut png), image::ImageFormat::Png)
            .unwrap();
        let shot = Screenshot::from_png(png).unwrap();
        assert_eq!(shot.pixels.dimensions(), (2, 2));
        assert!(shot.data_uri().starts_with("data:image/png;base64,iVBOR"));
    }
}
