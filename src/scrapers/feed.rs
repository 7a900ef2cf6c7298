//! RSS 2.0 listing parser.
//!
//! Only the fields the crawler uses are kept. Image candidates are collected
//! in preference order: `media:content`, `media:thumbnail`, an image
//! `enclosure`, then the first `<img>` inside the description HTML.

use crate::error::CrawlError;
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event};
use scraper::{Html, Selector};

static IMG: Lazy<Selector> = Lazy::new(|| Selector::parse("img[src]").expect("static selector"));

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FeedItem {
    pub title: String,
    pub link: String,
    /// Raw description, usually HTML.
    pub description: String,
    pub pub_date: Option<DateTime<Utc>>,
    pub media_content: Option<String>,
    pub media_thumbnail: Option<String>,
    pub enclosure: Option<String>,
}

impl FeedItem {
    pub fn image_candidates(&self) -> Vec<String> {
        let mut candidates: Vec<String> = [&self.media_content, &self.media_thumbnail, &self.enclosure]
            .into_iter()
            .flatten()
            .cloned()
            .collect();
        if !self.description.is_empty() {
            let fragment = Html::parse_fragment(&self.description);
            if let Some(src) = fragment
                .select(&IMG)
                .next()
                .and_then(|img| img.value().attr("src"))
            {
                candidates.push(src.to_string());
            }
        }
        candidates
    }
}

#[derive(Clone, Copy, PartialEq)]
enum Field {
    Title,
    Link,
    Description,
    PubDate,
}

fn attr(e: &BytesStart<'_>, name: &[u8]) -> Option<String> {
    e.attributes().flatten().find(|a| a.key.as_ref() == name).map(|a| {
        let raw = String::from_utf8_lossy(&a.value).into_owned();
        quick_xml::escape::unescape(&raw)
            .map(|v| v.into_owned())
            .unwrap_or(raw)
    })
}

fn record_media(item: &mut FeedItem, e: &BytesStart<'_>) {
    match e.name().as_ref() {
        b"media:content" => {
            let is_image = attr(e, b"medium").is_none_or(|m| m == "image")
                && attr(e, b"type").is_none_or(|t| t.starts_with("image/"));
            if is_image && item.media_content.is_none() {
                item.media_content = attr(e, b"url");
            }
        }
        b"media:thumbnail" if item.media_thumbnail.is_none() => {
            item.media_thumbnail = attr(e, b"url");
        }
        b"enclosure" if item.enclosure.is_none() => {
            if attr(e, b"type").is_none_or(|t| t.starts_with("image/")) {
                item.enclosure = attr(e, b"url");
            }
        }
        _ => {}
    }
}

fn parse_date(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    DateTime::parse_from_rfc2822(raw)
        .or_else(|_| DateTime::parse_from_rfc3339(raw))
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
}

/// Parse an RSS document into items. Items without a title or link are skipped.
pub fn parse_feed(xml: &str) -> Result<Vec<FeedItem>, CrawlError> {
    // no trim_text: entity references split text events and trimming would eat the spaces around them
    let mut reader = Reader::from_str(xml);

    let mut items = Vec::new();
    let mut current: Option<FeedItem> = None;
    let mut field: Option<Field> = None;
    let mut text = String::new();
    let mut pub_date_raw = String::new();

    loop {
        let event = reader.read_event().map_err(|e| CrawlError::Parse {
            what: "rss feed",
            reason: format!("at byte {}: {e}", reader.buffer_position()),
        })?;

        match event {
            Event::Start(e) => match e.name().as_ref() {
                b"item" => {
                    current = Some(FeedItem::default());
                    pub_date_raw.clear();
                }
                name if current.is_some() => {
                    field = match name {
                        b"title" => Some(Field::Title),
                        b"link" => Some(Field::Link),
                        b"description" => Some(Field::Description),
                        b"pubDate" => Some(Field::PubDate),
                        _ => None,
                    };
                    text.clear();
                    if let Some(item) = current.as_mut() {
                        record_media(item, &e);
                    }
                }
                _ => {}
            },
            Event::Empty(e) => {
                if let Some(item) = current.as_mut() {
                    record_media(item, &e);
                }
            }
            Event::Text(t) if field.is_some() => {
                text.push_str(&String::from_utf8_lossy(&t));
            }
            Event::CData(c) if field.is_some() => {
                text.push_str(&String::from_utf8_lossy(&c));
            }
            Event::GeneralRef(r) if field.is_some() => {
                if let Ok(Some(ch)) = r.resolve_char_ref() {
                    text.push(ch);
                } else {
                    let name = String::from_utf8_lossy(&r);
                    match quick_xml::escape::resolve_predefined_entity(&name) {
                        Some(resolved) => text.push_str(resolved),
                        None => text.push_str(&format!("&{name};")),
                    }
                }
            }
            Event::End(e) => match e.name().as_ref() {
                b"item" => {
                    if let Some(mut item) = current.take() {
                        item.pub_date = parse_date(&pub_date_raw);
                        if !item.title.is_empty() && !item.link.is_empty() {
                            items.push(item);
                        }
                    }
                }
                _ => {
                    if let (Some(item), Some(f)) = (current.as_mut(), field.take()) {
                        let value = text.trim().to_string();
                        match f {
                            Field::Title => item.title = value,
                            Field::Link => item.link = value,
                            Field::Description => item.description = value,
                            Field::PubDate => pub_date_raw = value,
                        }
                    }
                    text.clear();
                }
            },
            Event::Eof => break,
            _ => {}
        }
    }

    Ok(items)
}

#[cfg(test)]
mod tests {
    use super::*;

    const FEED: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<rss version="2.0" xmlns:media="http://search.yahoo.com/mrss/">
  <channel>
    <title>Clarín - Economía</title>
    <item>
      <title>El dólar blue &amp; el oficial</title>
      <link>https://www.clarin.com/economia/dolar-blue_0_abc.html</link>
      <description><![CDATA[<p><img src="https://img.clarin.com/desc.jpg"/>Resumen de la nota</p>]]></description>
      <pubDate>Sun, 16 Nov 2025 10:30:00 -0300</pubDate>
      <media:content url="https://img.clarin.com/principal.jpg" medium="image"/>
      <media:thumbnail url="https://img.clarin.com/thumb.jpg"/>
    </item>
    <item>
      <title>Nota sin imagen</title>
      <link>https://www.clarin.com/economia/sin-imagen_0_def.html</link>
      <enclosure url="https://img.clarin.com/audio.mp3" type="audio/mpeg"/>
    </item>
    <item>
      <title></title>
      <link>https://www.clarin.com/economia/sin-titulo.html</link>
    </item>
  </channel>
</rss>"#;

    #[test]
    fn test_parse_feed_items() {
        let items = parse_feed(FEED).unwrap();
        assert_eq!(items.len(), 2);

        let first = &items[0];
        assert_eq!(first.title, "El dólar blue & el oficial");
        assert_eq!(first.link, "https://www.clarin.com/economia/dolar-blue_0_abc.html");
        assert_eq!(
            first.pub_date.unwrap().to_rfc3339(),
            "2025-11-16T13:30:00+00:00"
        );
        assert_eq!(
            first.image_candidates(),
            vec![
                "https://img.clarin.com/principal.jpg",
                "https://img.clarin.com/thumb.jpg",
                "https://img.clarin.com/desc.jpg",
            ]
        );

        let second = &items[1];
        assert!(second.pub_date.is_none());
        assert!(second.image_candidates().is_empty());
    }

    #[test]
    fn test_channel_title_is_not_an_item() {
        let items = parse_feed(FEED).unwrap();
        assert!(items.iter().all(|i| i.title != "Clarín - Economía"));
    }

    #[test]
    fn test_malformed_feed_is_a_parse_error() {
        let err = parse_feed("<rss><channel><item><title>x</item></rss>").unwrap_err();
        assert!(matches!(err, CrawlError::Parse { .. }));
    }
}
