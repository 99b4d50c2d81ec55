use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use base64::Engine as _;
use image::{ImageFormat, Rgb, RgbImage};
use pixelcast_contracts::images::ImagePayload;
use pixelcast_contracts::requests::GenerationResult;
use serde_json::{json, Value};

use crate::error::{PixelcastError, Result};
use crate::fanout::WORKER_THREAD_PREFIX;
use crate::gemini::{ImageModel, RemoteRequest};
use crate::BASE64;

pub const SCRIPTED_TEXT: &str = "Here you go.";

/// Stand-in for the remote model. The fan-out slot is read from the worker
/// thread's name; calls made on any other thread count as slot 0.
#[derive(Default)]
pub struct ScriptedModel {
    calls: AtomicUsize,
    worker_calls: AtomicUsize,
    reverse_delay: Option<Duration>,
    failing_slot: Option<usize>,
    slow_success: Option<Duration>,
    png_size: Option<(u32, u32)>,
    requests: Mutex<Vec<RemoteRequest>>,
}

impl ScriptedModel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Slot `i` sleeps `(10 - i) * step`, so later slots finish first.
    pub fn with_reverse_delay(mut self, step: Duration) -> Self {
        self.reverse_delay = Some(step);
        self
    }

    pub fn with_failing_slot(mut self, slot: usize) -> Self {
        self.failing_slot = Some(slot);
        self
    }

    pub fn with_slow_success(mut self, delay: Duration) -> Self {
        self.slow_success = Some(delay);
        self
    }

    /// Answer with decodable PNG gradients instead of slot tags.
    pub fn with_png_images(mut self, width: u32, height: u32) -> Self {
        self.png_size = Some((width, height));
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn worker_calls(&self) -> usize {
        self.worker_calls.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<RemoteRequest> {
        self.requests
            .lock()
            .map(|requests| requests.clone())
            .unwrap_or_default()
    }
}

impl ImageModel for ScriptedModel {
    fn name(&self) -> &str {
        "scripted"
    }

    fn generate(&self, request: &RemoteRequest) -> Result<Vec<Value>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request.clone());
        }
        let worker_slot = thread::current()
            .name()
            .and_then(|name| name.strip_prefix(WORKER_THREAD_PREFIX))
            .and_then(|slot| slot.parse::<usize>().ok());
        if worker_slot.is_some() {
            self.worker_calls.fetch_add(1, Ordering::SeqCst);
        }
        let slot = worker_slot.unwrap_or(0);

        if self.failing_slot == Some(slot) {
            return Err(PixelcastError::RemoteGeneration(format!(
                "slot {slot} refused"
            )));
        }
        if let Some(step) = self.reverse_delay {
            thread::sleep(step * (10 - slot.min(10)) as u32);
        }
        if let Some(delay) = self.slow_success {
            thread::sleep(delay);
        }

        let data = match self.png_size {
            Some((width, height)) => gradient_payload(width, height).data,
            None => BASE64.encode(format!("slot-{slot}")),
        };
        Ok(vec![json!({
            "candidates": [{
                "content": {
                    "parts": [
                        {"text": SCRIPTED_TEXT},
                        {"inlineData": {"mimeType": "image/png", "data": data}},
                    ]
                }
            }]
        })])
    }
}

pub fn decoded_tag(payload: &ImagePayload) -> String {
    BASE64
        .decode(payload.data.as_bytes())
        .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
        .unwrap_or_default()
}

pub fn gradient_png(width: u32, height: u32) -> Vec<u8> {
    let image = RgbImage::from_fn(width, height, |x, y| {
        Rgb([
            (x * 255 / width.max(1)) as u8,
            (y * 255 / height.max(1)) as u8,
            ((x + y) * 7 % 256) as u8,
        ])
    });
    let mut bytes = Vec::new();
    image
        .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
        .expect("encode gradient png");
    bytes
}

pub fn gradient_payload(width: u32, height: u32) -> ImagePayload {
    ImagePayload {
        mime_type: "image/png".to_string(),
        data: BASE64.encode(gradient_png(width, height)),
    }
}

pub fn result_with(prompt: &str, images: Vec<ImagePayload>) -> GenerationResult {
    GenerationResult {
        generation_id: "gen-test".to_string(),
        prompt: prompt.to_string(),
        images,
        text: String::new(),
        responses: Vec::new(),
        reference_profile: None,
        warnings: Vec::new(),
    }
}

/// Indexed PNG fixture. Pixel `i` uses palette index `i % min(palette_len, 16)`.
/// With `valid_idat` false the IDAT chunk holds garbage, so the header parses but
/// the pixel plane does not decode.
pub fn indexed_png(
    width: u32,
    height: u32,
    bit_depth: u8,
    palette_len: usize,
    valid_idat: bool,
) -> Vec<u8> {
    let palette: Vec<u8> = (0..palette_len)
        .flat_map(|k| {
            [
                (k * 15 % 256) as u8,
                ((k * 7 + 3) % 256) as u8,
                (255 - k % 256) as u8,
            ]
        })
        .collect();

    let mut bytes = Vec::new();
    {
        let mut encoder = png::Encoder::new(&mut bytes, width, height);
        encoder.set_color(png::ColorType::Indexed);
        encoder.set_depth(png::BitDepth::from_u8(bit_depth).expect("valid png bit depth"));
        encoder.set_palette(palette);
        let mut writer = encoder.write_header().expect("write png header");
        if valid_idat {
            writer
                .write_image_data(&packed_indices(width, height, bit_depth, palette_len))
                .expect("write png pixels");
        } else {
            writer
                .write_chunk(png::chunk::IDAT, b"definitely not zlib")
                .expect("write garbage idat");
        }
        writer.finish().expect("finish png");
    }
    bytes
}

fn packed_indices(width: u32, height: u32, bit_depth: u8, palette_len: usize) -> Vec<u8> {
    let used = palette_len.clamp(1, 16);
    let row_len = (width as usize * bit_depth as usize).div_ceil(8);
    let mut packed = Vec::with_capacity(row_len * height as usize);
    for y in 0..height as usize {
        let mut row = vec![0u8; row_len];
        for x in 0..width as usize {
            let index = ((y * width as usize + x) % used) as u8;
            let bit = x * bit_depth as usize;
            let shift = 8 - bit_depth as usize - bit % 8;
            row[bit / 8] |= index << shift;
        }
        packed.extend_from_slice(&row);
    }
    packed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn indexed_fixture_decodes_with_expected_palette() -> anyhow::Result<()> {
        let decoded = image::load_from_memory(&indexed_png(4, 1, 8, 4, true))?.to_rgb8();
        assert_eq!(decoded.get_pixel(0, 0).0, [0, 3, 255]);
        assert_eq!(decoded.get_pixel(3, 0).0, [45, 24, 252]);
        Ok(())
    }
}
