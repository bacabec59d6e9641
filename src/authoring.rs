//! Assembling the output PDF.
//!
//! Each output page embeds the rendered page image as a full-page XObject
//! and appends the composed invisible text operations on top. The
//! orchestrator treats this as an opaque authoring library: pages in,
//! bytes out.

use lopdf::{
    Dictionary, Document, Object, Stream,
    content::{Content, Operation},
    dictionary,
};

use crate::{
    compose::TEXT_FONT,
    prelude::*,
    render::{PageTransform, Raster},
};

/// Name of the page image resource in each page's content stream.
const PAGE_IMAGE: &str = "Im0";

/// Incrementally builds the searchable output document.
pub struct SearchablePdfBuilder {
    doc: Document,
    /// Reserved id for the page tree, referenced as each page's parent.
    pages_id: lopdf::ObjectId,
    /// Shared WinAnsi Helvetica used by every text layer.
    font_id: lopdf::ObjectId,
    page_ids: Vec<lopdf::ObjectId>,
}

impl SearchablePdfBuilder {
    pub fn new() -> Self {
        let mut doc = Document::with_version("1.5");
        let pages_id = doc.new_object_id();
        let font_id = doc.add_object(dictionary! {
            "Type" => "Font",
            "Subtype" => "Type1",
            "BaseFont" => "Helvetica",
            "Encoding" => "WinAnsiEncoding",
        });
        Self {
            doc,
            pages_id,
            font_id,
            page_ids: Vec::new(),
        }
    }

    /// Append one page: the rendered image scaled to the full page, then
    /// the invisible text layer.
    pub fn add_page(
        &mut self,
        raster: &Raster,
        transform: &PageTransform,
        text_ops: Vec<Operation>,
    ) -> Result<()> {
        // pdftocairo produces RGB JPEGs, which embed directly as DCTDecode
        // streams without re-encoding.
        let image_id = self.doc.add_object(Stream::new(
            dictionary! {
                "Type" => "XObject",
                "Subtype" => "Image",
                "Width" => raster.width_px as i64,
                "Height" => raster.height_px as i64,
                "ColorSpace" => "DeviceRGB",
                "BitsPerComponent" => 8,
                "Filter" => "DCTDecode",
            },
            raster.data.clone(),
        ));

        let mut operations = vec![
            Operation::new("q", vec![]),
            Operation::new(
                "cm",
                vec![
                    Object::Real(transform.page_width_pt),
                    Object::Real(0.0),
                    Object::Real(0.0),
                    Object::Real(transform.page_height_pt),
                    Object::Real(0.0),
                    Object::Real(0.0),
                ],
            ),
            Operation::new("Do", vec![Object::Name(PAGE_IMAGE.into())]),
            Operation::new("Q", vec![]),
        ];
        operations.extend(text_ops);

        let content = Content { operations }
            .encode()
            .context("failed to encode page content stream")?;
        let content_id = self
            .doc
            .add_object(Stream::new(dictionary! {}, content));

        let resources: Dictionary = dictionary! {
            "XObject" => dictionary! { PAGE_IMAGE => image_id },
            "Font" => dictionary! { TEXT_FONT => self.font_id },
        };
        let page_id = self.doc.add_object(dictionary! {
            "Type" => "Page",
            "Parent" => self.pages_id,
            "MediaBox" => vec![
                0.into(),
                0.into(),
                Object::Real(transform.page_width_pt),
                Object::Real(transform.page_height_pt),
            ],
            "Resources" => resources,
            "Contents" => content_id,
        });
        self.page_ids.push(page_id);
        Ok(())
    }

    /// Number of pages added so far.
    pub fn page_count(&self) -> usize {
        self.page_ids.len()
    }

    /// Finish the document and return its bytes.
    pub fn finish(mut self) -> Result<Vec<u8>> {
        let kids: Vec<Object> = self.page_ids.iter().map(|&id| id.into()).collect();
        self.doc.objects.insert(
            self.pages_id,
            Object::Dictionary(dictionary! {
                "Type" => "Pages",
                "Kids" => kids,
                "Count" => self.page_ids.len() as i64,
            }),
        );
        let catalog_id = self.doc.add_object(dictionary! {
            "Type" => "Catalog",
            "Pages" => self.pages_id,
        });
        self.doc.trailer.set("Root", catalog_id);

        let mut bytes = Vec::new();
        self.doc
            .save_to(&mut bytes)
            .context("failed to serialize output PDF")?;
        Ok(bytes)
    }
}

impl Default for SearchablePdfBuilder {
    fn default() -> Self {
        Self::new()
    }
}
