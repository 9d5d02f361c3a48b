use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use quick_xml::events::Event;
use quick_xml::Reader;

use crate::error::TradutorError;

/// One aligned sentence pair. The source side already carries the
/// target-language tag prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranslationPair {
    pub source: String,
    pub target: String,
}

/// Read aligned pairs from a TMX translation-memory file.
///
/// Language matching is lenient: `pt` accepts `pt_br`, `pt-BR` and similar
/// region-tagged variants, which is what the OPUS TED corpus uses.
pub fn read_pairs(
    path: impl AsRef<Path>,
    src_lang: &str,
    tgt_lang: &str,
    prefix: &str,
) -> Result<Vec<TranslationPair>, TradutorError> {
    let path = path.as_ref();
    let file = File::open(path).map_err(|e| TradutorError::corpus(path, e))?;
    let pairs = parse_tmx(BufReader::new(file), src_lang, tgt_lang, prefix)
        .map_err(|e| TradutorError::corpus(path, e))?;

    if pairs.is_empty() {
        return Err(TradutorError::corpus(
            path,
            format!("no {src_lang}/{tgt_lang} translation units found"),
        ));
    }
    tracing::debug!("read {} translation pairs from {}", pairs.len(), path.display());
    Ok(pairs)
}

fn lang_matches(lang: &str, want: &str) -> bool {
    let lang = lang.to_ascii_lowercase().replace('-', "_");
    let want = want.to_ascii_lowercase().replace('-', "_");
    lang == want || lang.starts_with(&format!("{want}_"))
}

fn parse_tmx<R: BufRead>(
    reader: R,
    src_lang: &str,
    tgt_lang: &str,
    prefix: &str,
) -> anyhow::Result<Vec<TranslationPair>> {
    let mut xml = Reader::from_reader(reader);
    xml.trim_text(true);

    let mut pairs = Vec::new();
    let mut buf = Vec::new();

    // State while walking <tu><tuv xml:lang=..><seg>text</seg></tuv>...</tu>
    let mut cur_lang: Option<String> = None;
    let mut in_seg = false;
    let mut seg_text = String::new();
    let mut source: Option<String> = None;
    let mut target: Option<String> = None;

    loop {
        match xml.read_event_into(&mut buf)? {
            Event::Start(e) => match e.name().as_ref() {
                b"tu" => {
                    source = None;
                    target = None;
                }
                b"tuv" => {
                    cur_lang = None;
                    for attr in e.attributes() {
                        let attr = attr?;
                        if matches!(attr.key.as_ref(), b"xml:lang" | b"lang") {
                            cur_lang = Some(attr.unescape_value()?.into_owned());
                        }
                    }
                }
                b"seg" => {
                    in_seg = true;
                    seg_text.clear();
                }
                _ => {}
            },
            Event::Text(t) => {
                if in_seg {
                    seg_text.push_str(&t.unescape()?);
                }
            }
            Event::End(e) => match e.name().as_ref() {
                b"seg" => {
                    in_seg = false;
                    if let Some(lang) = cur_lang.as_deref() {
                        if lang_matches(lang, src_lang) {
                            source = Some(seg_text.clone());
                        } else if lang_matches(lang, tgt_lang) {
                            target = Some(seg_text.clone());
                        }
                    }
                }
                b"tu" => {
                    if let (Some(src), Some(tgt)) = (source.take(), target.take()) {
                        pairs.push(TranslationPair {
                            source: format!("{prefix} {src}"),
                            target: tgt,
                        });
                    }
                }
                _ => {}
            },
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    Ok(pairs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    const SAMPLE: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<tmx version="1.4">
  <header srclang="en" datatype="plaintext"/>
  <body>
    <tu>
      <tuv xml:lang="en"><seg>We can do better.</seg></tuv>
      <tuv xml:lang="pt-br"><seg>Podemos fazer melhor.</seg></tuv>
    </tu>
    <tu>
      <tuv xml:lang="en"><seg>Help is on the way.</seg></tuv>
      <tuv xml:lang="pt-br"><seg>A ajuda est&#225; a caminho.</seg></tuv>
    </tu>
    <tu>
      <tuv xml:lang="fr"><seg>Bonjour.</seg></tuv>
      <tuv xml:lang="pt-br"><seg>Bom dia.</seg></tuv>
    </tu>
  </body>
</tmx>"#;

    #[test]
    fn test_parse_tmx_pairs() {
        let pairs = parse_tmx(Cursor::new(SAMPLE), "en", "pt", ">>pt_br<<").unwrap();
        assert_eq!(pairs.len(), 2);
        assert_eq!(pairs[0].source, ">>pt_br<< We can do better.");
        assert_eq!(pairs[0].target, "Podemos fazer melhor.");
        assert_eq!(pairs[1].target, "A ajuda está a caminho.");
    }

    #[test]
    fn test_unit_without_source_is_skipped() {
        let pairs = parse_tmx(Cursor::new(SAMPLE), "en", "pt", ">>pt_br<<").unwrap();
        assert!(pairs.iter().all(|p| !p.source.contains("Bonjour")));
    }

    #[test]
    fn test_lang_matching_is_lenient() {
        assert!(lang_matches("pt_br", "pt"));
        assert!(lang_matches("pt-BR", "pt"));
        assert!(lang_matches("en", "en"));
        assert!(!lang_matches("fr", "pt"));
        assert!(!lang_matches("pta", "pt"));
    }

    #[test]
    fn test_malformed_xml_fails() {
        let broken = "<tmx><body><tu><tuv xml:lang=";
        assert!(parse_tmx(Cursor::new(broken), "en", "pt", "").is_err());
    }

    #[test]
    fn test_missing_file_fails() {
        let err = read_pairs("does-not-exist.tmx", "en", "pt", "").unwrap_err();
        assert!(matches!(err, TradutorError::CorpusRead { .. }));
    }
}
