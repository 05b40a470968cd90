//! Zonebot Formatter
//!
//! Message entity rendering to Telegram HTML and human-readable delay
//! formatting

use serde::{Deserialize, Serialize};

/// One Telegram message entity: a styled span over the raw text. Offset
/// and length count UTF-16 code units, the way the Bot API reports them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageEntity {
    #[serde(rename = "type")]
    pub kind: String,
    pub offset: usize,
    pub length: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<EntityUser>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityUser {
    pub id: i64,
}

/// Result of rendering: the text to send and whether HTML parse mode must
/// be enabled. Plain messages keep parse mode off so literal hashtags and
/// angle brackets survive untouched.
#[derive(Debug, Clone, PartialEq)]
pub struct FormattedMessage {
    pub text: String,
    pub parse_html: bool,
}

/// Render a raw text plus entities into an HTML-markup string.
///
/// Entities are applied rightmost-first: splicing the rightmost span leaves
/// every not-yet-processed offset valid, since earlier entities only touch
/// regions to the left. Offsets index UTF-16 code units, so the text is
/// spliced in that encoding; an emoji before a span weighs two units. An
/// entity whose span falls outside the text is skipped; malformed input
/// never aborts the message. Unknown entity kinds pass through unchanged.
pub fn render_message(text: &str, entities: &[MessageEntity]) -> FormattedMessage {
    if entities.is_empty() {
        return FormattedMessage {
            text: text.to_string(),
            parse_html: false,
        };
    }

    let mut units: Vec<u16> = text.encode_utf16().collect();
    let mut sorted: Vec<&MessageEntity> = entities.iter().collect();
    sorted.sort_by(|a, b| b.offset.cmp(&a.offset));

    for entity in sorted {
        let start = entity.offset;
        let end = entity.offset + entity.length;
        if start >= units.len() || end > units.len() {
            continue;
        }

        let chunk = String::from_utf16_lossy(&units[start..end]);
        let wrapped = wrap_entity(entity, &chunk);
        units.splice(start..end, wrapped.encode_utf16().collect::<Vec<u16>>());
    }

    FormattedMessage {
        text: String::from_utf16_lossy(&units),
        parse_html: true,
    }
}

fn wrap_entity(entity: &MessageEntity, chunk: &str) -> String {
    match entity.kind.as_str() {
        "bold" => format!("<b>{}</b>", chunk),
        "italic" => format!("<i>{}</i>", chunk),
        "underline" => format!("<u>{}</u>", chunk),
        "strikethrough" => format!("<s>{}</s>", chunk),
        "code" => format!("<code>{}</code>", chunk),
        "pre" => format!("<pre>{}</pre>", chunk),
        "text_link" => match entity.url.as_deref() {
            Some(url) => format!("<a href=\"{}\">{}</a>", escape_attribute(url), chunk),
            None => chunk.to_string(),
        },
        "text_mention" => match &entity.user {
            Some(user) => format!("<a href=\"tg://user?id={}\">{}</a>", user.id, chunk),
            None => chunk.to_string(),
        },
        _ => chunk.to_string(),
    }
}

fn escape_attribute(value: &str) -> String {
    value.replace('&', "&amp;").replace('"', "&quot;")
}

/// Human-readable rendering of a delay in seconds: seconds below a minute,
/// whole minutes (with any remainder seconds) at or above.
pub fn format_delay(secs: i64) -> String {
    if secs < 60 {
        return plural(secs, "second");
    }
    let minutes = secs / 60;
    let remainder = secs % 60;
    if remainder == 0 {
        plural(minutes, "minute")
    } else {
        format!("{} {}", plural(minutes, "minute"), plural(remainder, "second"))
    }
}

fn plural(n: i64, unit: &str) -> String {
    if n == 1 {
        format!("1 {}", unit)
    } else {
        format!("{} {}s", n, unit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entity(kind: &str, offset: usize, length: usize) -> MessageEntity {
        MessageEntity {
            kind: kind.to_string(),
            offset,
            length,
            url: None,
            user: None,
        }
    }

    fn strip_tags(text: &str) -> String {
        let mut out = String::new();
        let mut in_tag = false;
        for c in text.chars() {
            match c {
                '<' => in_tag = true,
                '>' => in_tag = false,
                c if !in_tag => out.push(c),
                _ => {}
            }
        }
        out
    }

    #[test]
    fn plain_text_keeps_parse_mode_disabled() {
        let rendered = render_message("#ورود is literal", &[]);
        assert_eq!(rendered.text, "#ورود is literal");
        assert!(!rendered.parse_html);
    }

    #[test]
    fn bold_span_is_wrapped() {
        let rendered = render_message("Welcome!", &[entity("bold", 0, 7)]);
        assert_eq!(rendered.text, "<b>Welcome</b>!");
        assert!(rendered.parse_html);
    }

    #[test]
    fn multiple_disjoint_spans_do_not_corrupt_offsets() {
        let rendered = render_message(
            "one two three",
            &[entity("bold", 0, 3), entity("italic", 8, 5)],
        );
        assert_eq!(rendered.text, "<b>one</b> two <i>three</i>");
    }

    #[test]
    fn stripping_markup_round_trips_raw_text() {
        let text = "hello bold and سلام world";
        let entities = vec![
            entity("bold", 6, 4),
            entity("underline", 15, 4),
            entity("code", 20, 5),
        ];
        let rendered = render_message(text, &entities);
        assert_eq!(strip_tags(&rendered.text), text);
    }

    #[test]
    fn out_of_range_entity_is_skipped_without_side_effects() {
        let rendered = render_message(
            "short",
            &[entity("bold", 0, 5), entity("italic", 3, 40)],
        );
        assert_eq!(rendered.text, "<b>short</b>");
    }

    #[test]
    fn unknown_kind_passes_through() {
        let rendered = render_message("spoiler here", &[entity("spoiler", 0, 7)]);
        assert_eq!(rendered.text, "spoiler here");
        assert!(rendered.parse_html);
    }

    #[test]
    fn text_link_embeds_escaped_url() {
        let mut link = entity("text_link", 0, 4);
        link.url = Some("https://example.com/?a=1&b=\"2\"".to_string());
        let rendered = render_message("docs", &[link]);
        assert_eq!(
            rendered.text,
            "<a href=\"https://example.com/?a=1&amp;b=&quot;2&quot;\">docs</a>"
        );
    }

    #[test]
    fn text_mention_embeds_user_id() {
        let mut mention = entity("text_mention", 0, 4);
        mention.user = Some(EntityUser { id: 777 });
        let rendered = render_message("name", &[mention]);
        assert_eq!(rendered.text, "<a href=\"tg://user?id=777\">name</a>");
    }

    #[test]
    fn offsets_are_utf16_based_not_byte_based() {
        // Persian text: bold over the second word.
        let text = "سلام دنیا";
        let rendered = render_message(text, &[entity("bold", 5, 4)]);
        assert_eq!(rendered.text, "سلام <b>دنیا</b>");
    }

    #[test]
    fn non_bmp_character_before_span_weighs_two_units() {
        // The Bot API counts 😀 as two UTF-16 units, so "hi" starts at 3.
        let rendered = render_message("😀 hi", &[entity("bold", 3, 2)]);
        assert_eq!(rendered.text, "😀 <b>hi</b>");
    }

    #[test]
    fn spans_after_emoji_round_trip_when_stripped() {
        let text = "🚗 ready to go";
        let rendered = render_message(text, &[entity("italic", 3, 5)]);
        assert_eq!(rendered.text, "🚗 <i>ready</i> to go");
        assert_eq!(strip_tags(&rendered.text), text);
    }

    #[test]
    fn delay_boundary_has_no_off_by_one() {
        assert_eq!(format_delay(59), "59 seconds");
        assert_eq!(format_delay(60), "1 minute");
    }

    #[test]
    fn delay_formats_common_values() {
        assert_eq!(format_delay(1), "1 second");
        assert_eq!(format_delay(45), "45 seconds");
        assert_eq!(format_delay(120), "2 minutes");
        assert_eq!(format_delay(150), "2 minutes 30 seconds");
        assert_eq!(format_delay(3600), "60 minutes");
    }
}
