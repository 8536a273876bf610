//! USSD XML request parsing and response page rendering.

use std::{collections::HashMap, io::Cursor};

use quick_xml::{
    Reader, Writer,
    events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event},
};

use crate::TransportError;

/// Page indicator marking the first request of a session.
pub const NEW_SESSION_PAGE: &str = "0";

/// A decoded USSD request: the text of each child of the root element.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UssdRequest {
    fields: HashMap<String, String>,
}

impl UssdRequest {
    /// Parse a request document.
    ///
    /// # Errors
    /// Returns `MalformedRequest` if the body is not well-formed XML or
    /// has no root element.
    pub fn parse(xml: &str) -> Result<Self, TransportError> {
        let mut reader = Reader::from_str(xml);
        reader.config_mut().trim_text(true);

        let mut fields = HashMap::new();
        let mut depth = 0usize;
        let mut seen_root = false;
        let mut current: Option<String> = None;

        loop {
            match reader.read_event() {
                Ok(Event::Start(e)) => {
                    depth += 1;
                    seen_root = true;
                    if depth == 2 {
                        let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
                        fields.entry(name.clone()).or_insert_with(String::new);
                        current = Some(name);
                    }
                }
                Ok(Event::Empty(e)) => {
                    seen_root = true;
                    if depth == 1 {
                        let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
                        fields.entry(name).or_insert_with(String::new);
                    }
                }
                Ok(Event::Text(t)) => {
                    if let (2, Some(name)) = (depth, &current) {
                        let text = t
                            .unescape()
                            .map_err(|e| TransportError::MalformedRequest(e.to_string()))?;
                        if let Some(value) = fields.get_mut(name) {
                            value.push_str(&text);
                        }
                    }
                }
                Ok(Event::CData(t)) => {
                    if let (2, Some(name)) = (depth, &current) {
                        if let Some(value) = fields.get_mut(name) {
                            value.push_str(&String::from_utf8_lossy(&t));
                        }
                    }
                }
                Ok(Event::End(_)) => {
                    if depth == 2 {
                        current = None;
                    }
                    depth = depth.saturating_sub(1);
                }
                Ok(Event::Eof) => break,
                Ok(_) => {}
                Err(e) => {
                    return Err(TransportError::MalformedRequest(format!("Invalid XML: {e}")));
                }
            }
        }

        if !seen_root {
            return Err(TransportError::MalformedRequest("Empty document".into()));
        }
        Ok(Self { fields })
    }

    /// Value of an optional field.
    #[must_use]
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }

    /// Value of a mandatory field.
    ///
    /// # Errors
    /// Returns `MalformedRequest` naming the missing field.
    pub fn required(&self, name: &str) -> Result<&str, TransportError> {
        self.field(name)
            .ok_or_else(|| TransportError::missing_field(name))
    }

    /// Value of a mandatory field that must not be blank.
    ///
    /// # Errors
    /// Returns `MalformedRequest` if the field is missing or blank.
    pub fn required_non_empty(&self, name: &str) -> Result<&str, TransportError> {
        let value = self.required(name)?;
        if value.trim().is_empty() {
            return Err(TransportError::MalformedRequest(format!(
                "Empty request key: {name}"
            )));
        }
        Ok(value)
    }
}

/// Builder for a USSD response page.
#[derive(Debug, Clone)]
pub struct UssdPage {
    session_id: String,
    title: Option<String>,
    text: Vec<String>,
    nav: Vec<NavLink>,
}

#[derive(Debug, Clone)]
enum NavLink {
    MenuItem { text: String, option: String },
    FreeText,
}

impl UssdPage {
    #[must_use]
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            title: None,
            text: Vec::new(),
            nav: Vec::new(),
        }
    }

    pub fn set_title(&mut self, title: impl Into<String>) -> &mut Self {
        self.title = Some(title.into());
        self
    }

    pub fn add_text(&mut self, text: impl Into<String>) -> &mut Self {
        self.text.push(text.into());
        self
    }

    pub fn add_menu_item(&mut self, text: impl Into<String>, option: impl Into<String>) -> &mut Self {
        self.nav.push(NavLink::MenuItem {
            text: text.into(),
            option: option.into(),
        });
        self
    }

    /// Let the user answer with arbitrary text.
    pub fn add_freetext_option(&mut self) -> &mut Self {
        self.nav.push(NavLink::FreeText);
        self
    }

    /// Render the page document.
    ///
    /// # Errors
    /// Returns `Encode` if the XML writer fails.
    pub fn render(&self) -> Result<String, TransportError> {
        let mut writer = Writer::new_with_indent(Cursor::new(Vec::new()), b' ', 2);

        writer
            .write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))
            .map_err(encode_error)?;

        let mut page = BytesStart::new("page");
        page.push_attribute(("version", "2.0"));
        writer.write_event(Event::Start(page)).map_err(encode_error)?;

        write_text_element(&mut writer, "session_id", &self.session_id)?;
        if let Some(title) = &self.title {
            write_text_element(&mut writer, "title", title)?;
        }
        for text in &self.text {
            write_text_element(&mut writer, "div", text)?;
        }

        if !self.nav.is_empty() {
            writer
                .write_event(Event::Start(BytesStart::new("navigation")))
                .map_err(encode_error)?;
            for link in &self.nav {
                match link {
                    NavLink::MenuItem { text, option } => {
                        let mut start = BytesStart::new("link");
                        start.push_attribute(("accesskey", option.as_str()));
                        start.push_attribute(("pageId", format!("index{option}").as_str()));
                        writer.write_event(Event::Start(start)).map_err(encode_error)?;
                        writer
                            .write_event(Event::Text(BytesText::new(text)))
                            .map_err(encode_error)?;
                        writer
                            .write_event(Event::End(BytesEnd::new("link")))
                            .map_err(encode_error)?;
                    }
                    NavLink::FreeText => {
                        let mut empty = BytesStart::new("link");
                        empty.push_attribute(("accesskey", "*"));
                        empty.push_attribute(("pageId", "indexX"));
                        writer.write_event(Event::Empty(empty)).map_err(encode_error)?;
                    }
                }
            }
            writer
                .write_event(Event::End(BytesEnd::new("navigation")))
                .map_err(encode_error)?;
        }

        writer
            .write_event(Event::End(BytesEnd::new("page")))
            .map_err(encode_error)?;

        String::from_utf8(writer.into_inner().into_inner()).map_err(encode_error)
    }
}

fn encode_error(e: impl std::fmt::Display) -> TransportError {
    TransportError::Encode(e.to_string())
}

fn write_text_element(
    writer: &mut Writer<Cursor<Vec<u8>>>,
    name: &str,
    text: &str,
) -> Result<(), TransportError> {
    writer
        .write_event(Event::Start(BytesStart::new(name)))
        .map_err(encode_error)?;
    writer
        .write_event(Event::Text(BytesText::new(text)))
        .map_err(encode_error)?;
    writer
        .write_event(Event::End(BytesEnd::new(name)))
        .map_err(encode_error)
}
