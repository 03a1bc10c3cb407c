//! Appendix pages: raster receipts re-encoded as JPEG, and pages imported from PDF
//! receipts with the attachment label drawn on top.

use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, ExtendedColorType, ImageEncoder, ImageFormat};
use lopdf::content::{Content, Operation};
use lopdf::{dictionary, Dictionary, Object, ObjectId, Stream};

use reimburse_core::domain::attachment::{Attachment, FileType};

use super::layout::{real, text, PAGE_HEIGHT, PAGE_WIDTH};
use crate::error::RenderError;

pub(crate) const LABEL_FONT: &str = "FLabel";
pub(crate) const IMAGE_NAME: &str = "Im1";
const LABEL_SIZE: f32 = 18.0;
const LABEL_X: f32 = 40.0;
const LABEL_DROP: f32 = 60.0;
const IMAGE_BOX_WIDTH: f32 = 515.0;
const IMAGE_BOX_HEIGHT: f32 = 700.0;

/// Page attributes a page may inherit from its ancestors in the page tree.
const INHERITABLE: &[&[u8]] = &[b"Resources", b"MediaBox", b"CropBox", b"Rotate"];

#[derive(Clone, Copy, Debug)]
pub(crate) struct ImageLimits {
    pub max_dimension: u32,
    pub jpeg_quality: u8,
}

#[derive(Debug)]
pub(crate) struct RasterImage {
    pub width: u32,
    pub height: u32,
    pub jpeg: Vec<u8>,
}

/// `Attachment 3` or, when the attachment carries a displayed value, `Attachment 3: 12.50 €`.
pub(crate) fn label(number: usize, attachment: &Attachment) -> String {
    match attachment.value_cents {
        Some(cents) if !attachment.is_not_receipt => {
            format!("Attachment {number}: {} €", crate::pdf::euros(cents))
        }
        _ => format!("Attachment {number}"),
    }
}

fn downscale(image: DynamicImage, max_dimension: u32) -> DynamicImage {
    if image.width() > max_dimension || image.height() > max_dimension {
        image.resize(max_dimension, max_dimension, FilterType::Triangle)
    } else {
        image
    }
}

fn encode_jpeg(image: &DynamicImage, quality: u8) -> Result<RasterImage, RenderError> {
    let rgb = image.to_rgb8();
    let mut jpeg = Vec::new();
    JpegEncoder::new_with_quality(&mut jpeg, quality).write_image(
        rgb.as_raw(),
        rgb.width(),
        rgb.height(),
        ExtendedColorType::Rgb8,
    )?;
    Ok(RasterImage { width: rgb.width(), height: rgb.height(), jpeg })
}

/// Decodes a raster receipt, bounds its resolution and re-encodes it as JPEG.
pub(crate) fn prepare_raster(
    attachment_id: i64,
    bytes: &[u8],
    file_type: FileType,
    limits: ImageLimits,
) -> Result<RasterImage, RenderError> {
    let format = match file_type {
        FileType::Png => ImageFormat::Png,
        FileType::Gif => ImageFormat::Gif,
        FileType::Jpeg => ImageFormat::Jpeg,
        FileType::Pdf | FileType::Unknown => {
            return Err(RenderError::corrupt(attachment_id, "not a raster image"));
        }
    };
    let image = image::load_from_memory_with_format(bytes, format)
        .map_err(|error| RenderError::corrupt(attachment_id, error))?;
    encode_jpeg(&downscale(image, limits.max_dimension), limits.jpeg_quality)
}

pub(crate) fn image_xobject(image: &RasterImage) -> Stream {
    Stream::new(
        dictionary! {
            "Type" => "XObject",
            "Subtype" => "Image",
            "Width" => i64::from(image.width),
            "Height" => i64::from(image.height),
            "ColorSpace" => "DeviceRGB",
            "BitsPerComponent" => 8_i64,
            "Filter" => "DCTDecode"
        },
        image.jpeg.clone(),
    )
    .with_compression(false)
}

/// Label at the top left, image scaled to fit the box below it and centred horizontally.
pub(crate) fn image_page_operations(label: &str, image: &RasterImage) -> Vec<Operation> {
    let (width, height) = (image.width as f32, image.height as f32);
    let scale = (IMAGE_BOX_WIDTH / width).min(IMAGE_BOX_HEIGHT / height);
    let (drawn_width, drawn_height) = (width * scale, height * scale);
    let x = (PAGE_WIDTH - drawn_width) / 2.0;
    let y = PAGE_HEIGHT - LABEL_DROP - 20.0 - drawn_height;

    let mut operations = text(LABEL_FONT, LABEL_SIZE, LABEL_X, PAGE_HEIGHT - LABEL_DROP, label);
    operations.extend([
        Operation::new("q", vec![]),
        Operation::new(
            "cm",
            vec![real(drawn_width), real(0.0), real(0.0), real(drawn_height), real(x), real(y)],
        ),
        Operation::new("Do", vec![Object::Name(IMAGE_NAME.as_bytes().to_vec())]),
        Operation::new("Q", vec![]),
    ]);
    operations
}

/// Moves every page of a PDF receipt into `target` and returns the page ids in order.
/// Inherited page attributes are copied onto each page so the pages can be re-parented.
pub(crate) fn import_pdf_pages(
    target: &mut lopdf::Document,
    attachment_id: i64,
    bytes: &[u8],
    limits: ImageLimits,
) -> Result<Vec<ObjectId>, RenderError> {
    let mut source = lopdf::Document::load_mem(bytes)
        .map_err(|error| RenderError::corrupt(attachment_id, error))?;
    if source.trailer.get(b"Encrypt").is_ok() {
        return Err(RenderError::corrupt(attachment_id, "encrypted PDF"));
    }

    source.renumber_objects_with(target.max_id + 1);
    let page_ids: Vec<ObjectId> = source.get_pages().into_values().collect();
    if page_ids.is_empty() {
        return Err(RenderError::corrupt(attachment_id, "PDF has no pages"));
    }

    for page_id in &page_ids {
        let values: Vec<(&[u8], Object)> = INHERITABLE
            .iter()
            .filter_map(|key| inherited(&source, *page_id, key).map(|value| (*key, value)))
            .collect();
        let page = source
            .get_object_mut(*page_id)
            .and_then(Object::as_dict_mut)
            .map_err(|error| RenderError::corrupt(attachment_id, error))?;
        for (key, value) in values {
            page.set(key, value);
        }
    }

    source.objects.retain(|_, object| !is_tree_node(object));
    downscale_embedded_images(&mut source, attachment_id, limits);

    target.max_id = target.max_id.max(source.max_id);
    target.objects.extend(source.objects);
    Ok(page_ids)
}

fn inherited(doc: &lopdf::Document, page_id: ObjectId, key: &[u8]) -> Option<Object> {
    let mut node = doc.get_dictionary(page_id).ok()?;
    for _ in 0..32 {
        if let Ok(value) = node.get(key) {
            return Some(value.clone());
        }
        let parent = node.get(b"Parent").and_then(Object::as_reference).ok()?;
        node = doc.get_dictionary(parent).ok()?;
    }
    None
}

fn is_tree_node(object: &Object) -> bool {
    object
        .as_dict()
        .and_then(|dict| dict.get(b"Type"))
        .and_then(Object::as_name)
        .map(|name| name == b"Pages" || name == b"Catalog")
        .unwrap_or(false)
}

fn integer(dict: &Dictionary, key: &[u8]) -> Option<i64> {
    match dict.get(key).ok()? {
        Object::Integer(value) => Some(*value),
        _ => None,
    }
}

fn is_oversized_jpeg(dict: &Dictionary, max_dimension: u32) -> bool {
    let is_image = dict.get(b"Subtype").and_then(Object::as_name).map(|name| name == b"Image");
    let is_jpeg = dict.get(b"Filter").and_then(Object::as_name).map(|name| name == b"DCTDecode");
    let limit = i64::from(max_dimension);
    let oversized = integer(dict, b"Width").is_some_and(|width| width > limit)
        || integer(dict, b"Height").is_some_and(|height| height > limit);
    is_image.unwrap_or(false) && is_jpeg.unwrap_or(false) && oversized
}

/// Re-encodes JPEG images inside an imported PDF that exceed the size limit. Images in
/// other encodings, or that fail to decode, are kept as they are.
fn downscale_embedded_images(source: &mut lopdf::Document, attachment_id: i64, limits: ImageLimits) {
    for (object_id, object) in source.objects.iter_mut() {
        let Object::Stream(stream) = object else { continue };
        if !is_oversized_jpeg(&stream.dict, limits.max_dimension) {
            continue;
        }

        let resized = image::load_from_memory_with_format(&stream.content, ImageFormat::Jpeg)
            .map_err(RenderError::from)
            .and_then(|image| encode_jpeg(&downscale(image, limits.max_dimension), limits.jpeg_quality));
        match resized {
            Ok(raster) => {
                stream.dict.set("Width", i64::from(raster.width));
                stream.dict.set("Height", i64::from(raster.height));
                stream.dict.set("ColorSpace", "DeviceRGB");
                stream.dict.set("BitsPerComponent", 8_i64);
                stream.dict.remove(b"Decode");
                stream.dict.remove(b"DecodeParms");
                stream.set_content(raster.jpeg);
            }
            Err(error) => {
                tracing::debug!(
                    event_name = "documents.embedded_image_kept",
                    attachment_id,
                    object_id = object_id.0,
                    error = %error,
                    "embedded image left at original resolution"
                );
            }
        }
    }
}

fn number(object: &Object) -> Option<f32> {
    match object {
        Object::Integer(value) => Some(*value as f32),
        Object::Real(value) => Some(*value as f32),
        _ => None,
    }
}

fn page_box(doc: &lopdf::Document, value: Option<&Object>) -> Option<[f32; 4]> {
    let array = match value? {
        Object::Reference(id) => doc.get_object(*id).ok()?.as_array().ok()?,
        other => other.as_array().ok()?,
    };
    if array.len() != 4 {
        return None;
    }
    let mut corners = [0.0; 4];
    for (slot, value) in corners.iter_mut().zip(array) {
        *slot = number(value)?;
    }
    Some(corners)
}

fn resolved_dictionary(doc: &lopdf::Document, value: Option<&Object>) -> Dictionary {
    match value {
        Some(Object::Dictionary(dict)) => dict.clone(),
        Some(Object::Reference(id)) => doc.get_dictionary(*id).cloned().unwrap_or_else(|_| Dictionary::new()),
        _ => Dictionary::new(),
    }
}

/// Draws `label` over an imported page and attaches the page to `pages_id`. The original
/// content is wrapped in `q`/`Q` so its graphics state cannot leak into the label.
pub(crate) fn label_imported_page(
    target: &mut lopdf::Document,
    page_id: ObjectId,
    pages_id: ObjectId,
    label_font: ObjectId,
    label: &str,
) -> Result<(), RenderError> {
    let page = target.get_dictionary(page_id)?.clone();
    let [left, _, _, top] =
        page_box(target, page.get(b"MediaBox").ok()).unwrap_or([0.0, 0.0, PAGE_WIDTH, PAGE_HEIGHT]);

    let mut resources = resolved_dictionary(target, page.get(b"Resources").ok());
    let mut fonts = resolved_dictionary(target, resources.get(b"Font").ok());
    fonts.set(LABEL_FONT, label_font);
    resources.set("Font", fonts);

    let mut contents = match page.get(b"Contents") {
        Ok(Object::Reference(id)) => match target.get_object(*id) {
            Ok(Object::Array(items)) => items.clone(),
            _ => vec![Object::Reference(*id)],
        },
        Ok(Object::Array(items)) => items.clone(),
        _ => Vec::new(),
    };

    let open = target.add_object(Stream::new(Dictionary::new(), b"q\n".to_vec()));
    let mut overlay = vec![Operation::new("Q", vec![])];
    overlay.extend(text(LABEL_FONT, LABEL_SIZE, left + LABEL_X, top - LABEL_DROP, label));
    let close = target.add_object(Stream::new(Dictionary::new(), Content { operations: overlay }.encode()?));
    contents.insert(0, Object::Reference(open));
    contents.push(Object::Reference(close));

    let page = target.get_object_mut(page_id).and_then(Object::as_dict_mut)?;
    page.set("Resources", resources);
    page.set("Contents", contents);
    page.set("Parent", pages_id);
    Ok(())
}
