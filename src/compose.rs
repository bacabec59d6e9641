//! Composing the invisible text layer for one page.
//!
//! Recognized words arrive with bounding quads in image-pixel space; we
//! map them into page coordinates and emit PDF text operations in render
//! mode 3 (neither fill nor stroke), so the text is searchable and
//! selectable but draws no ink over the page image.

use lopdf::{Object, content::Operation};

use crate::{render::PageTransform, vision::RecognizedWord};

/// Invisible text is sized at this fraction of the word's mapped height,
/// approximating glyph cap-height so selections line up with the visible
/// glyphs underneath.
const FONT_SIZE_RATIO: f32 = 0.85;

/// Floor for the computed font size, in points.
const MIN_FONT_SIZE: f32 = 4.0;

/// Name of the page font resource the text operations reference.
pub const TEXT_FONT: &str = "F1";

/// Build the invisible text operations for a page's recognized words.
///
/// Words with empty trimmed text, fewer than four quad points, or a pixel
/// height that rounds below one pixel are noise and contribute nothing. A
/// page where every word is filtered out yields an empty instruction list;
/// the page still carries its image.
pub fn compose_text_layer(
    words: &[RecognizedWord],
    transform: &PageTransform,
) -> Vec<Operation> {
    let mut ops = Vec::new();
    for word in words {
        let text = word.text.trim();
        if text.is_empty() || word.quad.len() < 4 {
            continue;
        }

        // Quad point 0 is the top-left corner, point 3 the bottom-left.
        let top = word.quad[0];
        let bottom = word.quad[3];
        let height_px = (bottom.y - top.y).abs();
        if height_px.round() < 1.0 {
            continue;
        }

        // Anchor the baseline at the word's bottom-left corner.
        let (x_pt, y_pt) = transform.to_page_space(top.x, bottom.y);
        let height_pt = height_px * transform.scale_y;
        let font_size = (height_pt * FONT_SIZE_RATIO).max(MIN_FONT_SIZE);

        ops.push(Operation::new(
            "Tf",
            vec![
                Object::Name(TEXT_FONT.into()),
                Object::Real(font_size),
            ],
        ));
        ops.push(Operation::new(
            "Tm",
            vec![
                Object::Real(1.0),
                Object::Real(0.0),
                Object::Real(0.0),
                Object::Real(1.0),
                Object::Real(x_pt),
                Object::Real(y_pt),
            ],
        ));
        ops.push(Operation::new(
            "Tj",
            vec![Object::string_literal(encode_win_ansi(text))],
        ));
    }

    if ops.is_empty() {
        return ops;
    }

    // Wrap the whole layer in one text object with render mode 3.
    let mut layer = vec![
        Operation::new("BT", vec![]),
        Operation::new("Tr", vec![Object::Integer(3)]),
    ];
    layer.extend(ops);
    layer.push(Operation::new("ET", vec![]));
    layer
}

/// Encode text for a WinAnsi (CP-1252) simple font. Characters outside
/// the encoding degrade to `?`; the page image still shows the real glyph.
fn encode_win_ansi(text: &str) -> Vec<u8> {
    text.chars()
        .map(|c| match c {
            '\u{20AC}' => 0x80, // €
            '\u{2018}' => 0x91, // ‘
            '\u{2019}' => 0x92, // ’
            '\u{201C}' => 0x93, // “
            '\u{201D}' => 0x94, // ”
            '\u{2013}' => 0x96, // –
            '\u{2014}' => 0x97, // —
            c if (c as u32) < 0x80 || (0xA0..=0xFF).contains(&(c as u32)) => c as u8,
            _ => b'?',
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{render::Raster, vision::PixelPoint};

    fn word(text: &str, quad: [(f32, f32); 4]) -> RecognizedWord {
        RecognizedWord {
            text: text.to_string(),
            quad: quad.iter().map(|&(x, y)| PixelPoint { x, y }).collect(),
        }
    }

    /// 160x200px raster at 2x: page is 80x100pt, scale_y = 0.5.
    fn transform() -> PageTransform {
        PageTransform::new(
            &Raster {
                data: vec![],
                width_px: 160,
                height_px: 200,
            },
            2.0,
        )
    }

    /// Find the operands of the nth operation with the given operator.
    fn operands<'a>(ops: &'a [Operation], operator: &str) -> Vec<&'a Vec<Object>> {
        ops.iter()
            .filter(|op| op.operator == operator)
            .map(|op| &op.operands)
            .collect()
    }

    #[test]
    fn word_is_anchored_and_sized_from_its_quad() {
        let ops = compose_text_layer(
            &[word("hola", [(10.0, 10.0), (50.0, 10.0), (50.0, 30.0), (10.0, 30.0)])],
            &transform(),
        );

        // One text object: BT, Tr 3, Tf, Tm, Tj, ET.
        assert_eq!(ops[0].operator, "BT");
        assert_eq!(ops[1].operator, "Tr");
        assert_eq!(ops[1].operands, vec![Object::Integer(3)]);
        assert_eq!(ops.last().unwrap().operator, "ET");

        // Height 20px -> 10pt; font = max(8.5, 4) = 8.5.
        let tf = operands(&ops, "Tf")[0];
        assert_eq!(tf[1], Object::Real(8.5));

        // Anchor: x = 10 * 0.5 = 5, y = 100 - 30 * 0.5 = 85.
        let tm = operands(&ops, "Tm")[0];
        assert_eq!(tm[4], Object::Real(5.0));
        assert_eq!(tm[5], Object::Real(85.0));
    }

    #[test]
    fn every_qualifying_word_gets_one_instruction() {
        let words: Vec<_> = (0..5)
            .map(|i| {
                let x = 10.0 * i as f32;
                word("w", [(x, 10.0), (x + 8.0, 10.0), (x + 8.0, 20.0), (x, 20.0)])
            })
            .collect();
        let ops = compose_text_layer(&words, &transform());
        assert_eq!(operands(&ops, "Tj").len(), 5);
    }

    #[test]
    fn tiny_font_sizes_are_floored() {
        // 4px tall -> 2pt mapped -> 1.7pt raw, floored to 4pt.
        let ops = compose_text_layer(
            &[word("dot", [(0.0, 0.0), (8.0, 0.0), (8.0, 4.0), (0.0, 4.0)])],
            &transform(),
        );
        let tf = operands(&ops, "Tf")[0];
        assert_eq!(tf[1], Object::Real(MIN_FONT_SIZE));
    }

    #[test]
    fn noise_words_are_filtered() {
        let ops = compose_text_layer(
            &[
                // Empty after trimming.
                word("   ", [(0.0, 0.0), (10.0, 0.0), (10.0, 10.0), (0.0, 10.0)]),
                // Degenerate quad.
                RecognizedWord {
                    text: "clipped".to_string(),
                    quad: vec![PixelPoint { x: 1.0, y: 1.0 }],
                },
                // Sub-pixel height.
                word("thin", [(0.0, 10.0), (10.0, 10.0), (10.0, 10.4), (0.0, 10.4)]),
            ],
            &transform(),
        );
        assert!(ops.is_empty());
    }

    #[test]
    fn page_with_no_words_yields_no_instructions() {
        assert!(compose_text_layer(&[], &transform()).is_empty());
    }

    #[test]
    fn word_order_is_preserved() {
        let ops = compose_text_layer(
            &[
                word("second-on-page", [(0.0, 50.0), (20.0, 50.0), (20.0, 60.0), (0.0, 60.0)]),
                word("first-on-page", [(0.0, 10.0), (20.0, 10.0), (20.0, 20.0), (0.0, 20.0)]),
            ],
            &transform(),
        );
        let tjs = operands(&ops, "Tj");
        assert_eq!(tjs[0][0], Object::string_literal("second-on-page"));
        assert_eq!(tjs[1][0], Object::string_literal("first-on-page"));
    }

    #[test]
    fn win_ansi_covers_latin1_and_degrades_the_rest() {
        assert_eq!(encode_win_ansi("año"), vec![b'a', 0xF1, b'o']);
        assert_eq!(encode_win_ansi("€5"), vec![0x80, b'5']);
        assert_eq!(encode_win_ansi("日本"), vec![b'?', b'?']);
    }
}
