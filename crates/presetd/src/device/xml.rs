//! XML payloads of the speaker's local control API.
//!
//! Parsing is lenient about element order and unknown elements, strict about the few
//! fields we actually depend on (`deviceID`, preset `id`).

use roxmltree::Document;
use roxmltree::Node;

use super::client::DeviceInfo;
use super::client::DevicePreset;
use super::client::NowPlaying;
use crate::presets::PresetSlot;

/// Source used for presets that point back at our descriptor endpoint.
pub const LOCAL_RADIO_SOURCE: &str = "LOCAL_INTERNET_RADIO";

/// Sender name the firmware expects on simulated key presses.
const KEY_SENDER: &str = "Gabbo";

/// An `<error>` entry from an `<errors>` reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiError {
    pub name: String,
    pub value: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyState {
    Press,
    Release,
}

impl KeyState {
    fn as_str(self) -> &'static str {
        match self {
            KeyState::Press => "press",
            KeyState::Release => "release",
        }
    }
}

fn child<'a, 'input>(node: Node<'a, 'input>, name: &str) -> Option<Node<'a, 'input>> {
    node.children()
        .find(|n| n.is_element() && n.tag_name().name() == name)
}

fn child_text(node: Node, name: &str) -> Option<String> {
    child(node, name)
        .and_then(|n| n.text())
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
}

fn parse(xml: &str) -> Result<Document<'_>, String> {
    Document::parse(xml).map_err(|e| format!("XML parse error: {}", e))
}

fn expect_root<'a, 'input>(
    doc: &'a Document<'input>,
    name: &str,
) -> Result<Node<'a, 'input>, String> {
    let root = doc.root_element();
    if root.tag_name().name() == name {
        Ok(root)
    } else {
        Err(format!(
            "expected <{}> but got <{}>",
            name,
            root.tag_name().name()
        ))
    }
}

/// Parse the `/info` document.
pub fn parse_info(xml: &str) -> Result<DeviceInfo, String> {
    let doc = parse(xml)?;
    let root = expect_root(&doc, "info")?;

    let id = root
        .attribute("deviceID")
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| "<info> has no deviceID".to_string())?;

    let name = child_text(root, "name").unwrap_or_default();
    let model = child_text(root, "type").unwrap_or_default();

    // The SCM component carries the main firmware version; fall back to the first one listed.
    let firmware_version = child(root, "components").and_then(|components| {
        let mut listed = components
            .children()
            .filter(|n| n.is_element() && n.tag_name().name() == "component");
        let scm = listed
            .clone()
            .find(|c| child_text(*c, "componentCategory").as_deref() == Some("SCM"));
        scm.or_else(|| listed.next())
            .and_then(|c| child_text(c, "softwareVersion"))
    });

    let ip_address = child(root, "networkInfo").and_then(|n| child_text(n, "ipAddress"));

    Ok(DeviceInfo {
        id,
        name,
        model,
        firmware_version,
        ip_address,
    })
}

/// Parse the `/now_playing` document.
pub fn parse_now_playing(xml: &str) -> Result<NowPlaying, String> {
    let doc = parse(xml)?;
    let root = expect_root(&doc, "nowPlaying")?;

    let source = root.attribute("source").unwrap_or_default().to_string();
    let item_name = child(root, "ContentItem").and_then(|c| child_text(c, "itemName"));

    Ok(NowPlaying {
        source,
        item_name,
        track: child_text(root, "track"),
        artist: child_text(root, "artist"),
        album: child_text(root, "album"),
        station_name: child_text(root, "stationName"),
        play_status: child_text(root, "playStatus"),
    })
}

/// Parse the `/presets` document. Entries with an unusable `id` are skipped.
pub fn parse_presets(xml: &str) -> Result<Vec<DevicePreset>, String> {
    let doc = parse(xml)?;
    let root = expect_root(&doc, "presets")?;

    let presets = root
        .children()
        .filter(|n| n.is_element() && n.tag_name().name() == "preset")
        .filter_map(|preset| {
            let slot = preset
                .attribute("id")
                .and_then(|id| id.trim().parse::<u32>().ok())
                .and_then(|n| PresetSlot::try_from(n).ok())?;
            let content = child(preset, "ContentItem");
            Some(DevicePreset {
                slot,
                name: content.and_then(|c| child_text(c, "itemName")),
                source: content.and_then(|c| c.attribute("source")).map(String::from),
                location: content
                    .and_then(|c| c.attribute("location"))
                    .map(String::from),
            })
        })
        .collect();

    Ok(presets)
}

/// Parse an `<errors>` reply. Returns `None` if the document is anything else.
pub fn parse_errors(xml: &str) -> Option<Vec<ApiError>> {
    let doc = Document::parse(xml).ok()?;
    let root = doc.root_element();
    if root.tag_name().name() != "errors" {
        return None;
    }

    Some(
        root.children()
            .filter(|n| n.is_element() && n.tag_name().name() == "error")
            .map(|e| ApiError {
                name: e.attribute("name").unwrap_or_default().to_string(),
                value: e.attribute("value").map(String::from),
                message: e.text().map(|t| t.trim().to_string()).unwrap_or_default(),
            })
            .collect(),
    )
}

/// Request body for `/storePreset`.
pub fn store_preset_body(slot: PresetSlot, display_name: &str, descriptor_url: &str) -> String {
    format!(
        concat!(
            r#"<preset id="{slot}">"#,
            r#"<ContentItem source="{source}" type="stationurl" location="{location}" "#,
            r#"sourceAccount="" isPresetable="true">"#,
            "<itemName>{name}</itemName>",
            "</ContentItem>",
            "</preset>"
        ),
        slot = slot,
        source = LOCAL_RADIO_SOURCE,
        location = escape(descriptor_url),
        name = escape(display_name),
    )
}

/// Request body for `/key`.
pub fn key_body(slot: PresetSlot, state: KeyState) -> String {
    format!(
        r#"<key state="{}" sender="{}">PRESET_{}</key>"#,
        state.as_str(),
        KEY_SENDER,
        slot
    )
}

/// Escape text for use in XML content or attribute values.
pub fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            c => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const INFO: &str = r#"<?xml version="1.0" encoding="UTF-8" ?>
<info deviceID="689E19B8BB8A">
  <name>Living Room</name>
  <type>SoundTouch 300</type>
  <margeAccountUUID>1234567</margeAccountUUID>
  <components>
    <component>
      <componentCategory>LIGHTSWITCH</componentCategory>
      <softwareVersion>1.0.0</softwareVersion>
    </component>
    <component>
      <componentCategory>SCM</componentCategory>
      <softwareVersion>27.0.6.46330.5043500 epdbuild.trunk.hepdswbld04.2022-08-04T11:20:29</softwareVersion>
      <serialNumber>I6332527703739342000020</serialNumber>
    </component>
  </components>
  <networkInfo type="SCM">
    <macAddress>689E19B8BB8A</macAddress>
    <ipAddress>192.168.1.42</ipAddress>
  </networkInfo>
</info>"#;

    #[test]
    fn test_parse_info() {
        let info = parse_info(INFO).unwrap();
        assert_eq!(info.id, "689E19B8BB8A");
        assert_eq!(info.name, "Living Room");
        assert_eq!(info.model, "SoundTouch 300");
        assert!(info.firmware_version.unwrap().starts_with("27.0.6"));
        assert_eq!(info.ip_address.as_deref(), Some("192.168.1.42"));
    }

    #[test]
    fn test_parse_info_requires_device_id() {
        let err = parse_info("<info><name>x</name></info>").unwrap_err();
        assert!(err.contains("deviceID"));
    }

    #[test]
    fn test_parse_info_wrong_root() {
        let err = parse_info("<errors/>").unwrap_err();
        assert!(err.contains("<info>"));
        assert!(parse_info("not xml at all").is_err());
    }

    #[test]
    fn test_parse_now_playing() {
        let xml = r#"<nowPlaying deviceID="689E19B8BB8A" source="LOCAL_INTERNET_RADIO">
  <ContentItem source="LOCAL_INTERNET_RADIO" location="http://h/descriptor/x/1" isPresetable="true">
    <itemName>Jazz FM</itemName>
  </ContentItem>
  <track>So What</track>
  <artist>Miles Davis</artist>
  <stationName>Jazz FM</stationName>
  <playStatus>PLAY_STATE</playStatus>
</nowPlaying>"#;
        let np = parse_now_playing(xml).unwrap();
        assert!(!np.is_standby());
        assert_eq!(np.item_name.as_deref(), Some("Jazz FM"));
        assert_eq!(np.artist.as_deref(), Some("Miles Davis"));
        assert_eq!(np.album, None);
        assert_eq!(np.play_status.as_deref(), Some("PLAY_STATE"));

        let standby =
            parse_now_playing(r#"<nowPlaying deviceID="x" source="STANDBY"><ContentItem source="STANDBY"/></nowPlaying>"#)
                .unwrap();
        assert!(standby.is_standby());
    }

    #[test]
    fn test_parse_presets_skips_bad_ids() {
        let xml = r#"<presets>
  <preset id="1"><ContentItem source="LOCAL_INTERNET_RADIO" location="http://h/descriptor/x/1"><itemName>One</itemName></ContentItem></preset>
  <preset id="9"><ContentItem source="X"><itemName>Nine</itemName></ContentItem></preset>
  <preset id="3"><ContentItem source="TUNEIN" location="/v1/playback/station/s1"/></preset>
</presets>"#;
        let presets = parse_presets(xml).unwrap();
        assert_eq!(presets.len(), 2);
        assert_eq!(presets[0].slot.get(), 1);
        assert_eq!(presets[0].name.as_deref(), Some("One"));
        assert_eq!(presets[1].slot.get(), 3);
        assert_eq!(presets[1].name, None);
        assert_eq!(presets[1].source.as_deref(), Some("TUNEIN"));
    }

    #[test]
    fn test_parse_errors() {
        let xml = r#"<errors deviceID="x"><error value="1005" name="UNSUPPORTED" severity="Unknown">not supported</error></errors>"#;
        let errors = parse_errors(xml).unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].name, "UNSUPPORTED");
        assert_eq!(errors[0].value.as_deref(), Some("1005"));
        assert_eq!(errors[0].message, "not supported");

        assert!(parse_errors("<presets/>").is_none());
    }

    #[test]
    fn test_store_preset_body_is_escaped_and_parseable() {
        let slot = PresetSlot::try_from(2).unwrap();
        let body = store_preset_body(slot, "Rock & Roll <Live>", "http://h:8000/descriptor/a/2?x=1&y=2");

        let doc = Document::parse(&body).unwrap();
        let root = doc.root_element();
        assert_eq!(root.attribute("id"), Some("2"));
        let content = child(root, "ContentItem").unwrap();
        assert_eq!(content.attribute("source"), Some(LOCAL_RADIO_SOURCE));
        assert_eq!(
            content.attribute("location"),
            Some("http://h:8000/descriptor/a/2?x=1&y=2")
        );
        assert_eq!(
            child_text(content, "itemName").as_deref(),
            Some("Rock & Roll <Live>")
        );
    }

    #[test]
    fn test_key_body() {
        let slot = PresetSlot::try_from(4).unwrap();
        assert_eq!(
            key_body(slot, KeyState::Press),
            r#"<key state="press" sender="Gabbo">PRESET_4</key>"#
        );
        assert_eq!(
            key_body(slot, KeyState::Release),
            r#"<key state="release" sender="Gabbo">PRESET_4</key>"#
        );
    }
}
