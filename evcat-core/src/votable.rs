//! VOTable interchange codec.
//!
//! A catalogue is exported as one `TABLE`: catalogue metadata as `PARAM`s,
//! catalogue attributes as `PARAM`s inside `<GROUP name="attributes">`, one
//! `FIELD` per fixed event field followed by one per attribute key, and one
//! `TR` per event. Export requires every event to carry the same attribute
//! keys with the same value types.
//!
//! Import also accepts tables written by other tools: missing identifiers
//! are generated, a missing author column falls back to the catalogue
//! author, and unknown columns become attributes.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Display;
use std::path::Path;

use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event as XmlEvent};
use quick_xml::{Reader, Writer};
use uuid::Uuid;

use crate::db::Db;
use crate::error::VoTableError;
use crate::model::{AsCatalogueId, Catalogue, CatalogueDraft, Event};
use crate::time::{format_iso, parse_timestamp};
use crate::value::{AttrValue, Attributes, ValueKind};

const VOTABLE_NS: &str = "http://www.ivoa.net/xml/VOTable/v1.3";
const ATTRIBUTE_UTYPE: &str = "evcat:attribute";
const ATTRIBUTES_GROUP: &str = "attributes";

fn xml_err(e: impl Display) -> VoTableError {
    VoTableError::Xml(e.to_string())
}

// ---- Export ----

/// Python-style tuple of quoted keys, as in `('key0', 'key2')`.
fn key_tuple(keys: &BTreeSet<&str>) -> String {
    let quoted: Vec<String> = keys.iter().map(|k| format!("'{k}'")).collect();
    if quoted.len() == 1 {
        format!("({},)", quoted[0])
    } else {
        format!("({})", quoted.join(", "))
    }
}

/// Common attribute schema of `events`, ordered by key.
fn attribute_schema(events: &[Event]) -> Result<Vec<(String, ValueKind)>, VoTableError> {
    let Some(first) = events.first() else {
        return Ok(Vec::new());
    };
    let mut union: BTreeSet<&str> = BTreeSet::new();
    let mut common: BTreeSet<&str> = first.attributes.keys().map(String::as_str).collect();
    for event in events {
        let keys: BTreeSet<&str> = event.attributes.keys().map(String::as_str).collect();
        common = common.intersection(&keys).copied().collect();
        union.extend(keys);
    }
    let differing: BTreeSet<&str> = union.difference(&common).copied().collect();
    if !differing.is_empty() {
        return Err(VoTableError::Validation(format!(
            "not all attributes are present in all events {}",
            key_tuple(&differing)
        )));
    }

    let mut schema = Vec::with_capacity(common.len());
    for key in common {
        let kinds: BTreeSet<ValueKind> = events.iter().filter_map(|e| e.attributes.get(key)).map(AttrValue::kind).collect();
        if kinds.len() > 1 {
            return Err(VoTableError::Validation(format!(
                "not all value types are identical for all events for attribute {key}"
            )));
        }
        let kind = kinds.into_iter().next().unwrap_or(ValueKind::Null);
        schema.push((key.to_string(), kind));
    }
    Ok(schema)
}

fn datatype(kind: ValueKind) -> &'static str {
    match kind {
        ValueKind::Null | ValueKind::String => "char",
        ValueKind::Bool => "boolean",
        ValueKind::Integer => "long",
        ValueKind::Float => "double",
    }
}

fn cell_text(value: &AttrValue) -> String {
    match value {
        AttrValue::Null => String::new(),
        AttrValue::Float(v) => format!("{v:?}"),
        other => other.to_string(),
    }
}

fn json_list(values: &[String]) -> Result<String, VoTableError> {
    serde_json::to_string(values).map_err(|e| VoTableError::Db(e.into()))
}

struct TableWriter {
    writer: Writer<Vec<u8>>,
}

impl TableWriter {
    fn start(&mut self, tag: BytesStart<'_>) -> Result<(), VoTableError> {
        self.writer.write_event(XmlEvent::Start(tag)).map_err(xml_err)
    }

    fn end(&mut self, name: &str) -> Result<(), VoTableError> {
        self.writer.write_event(XmlEvent::End(BytesEnd::new(name))).map_err(xml_err)
    }

    fn empty(&mut self, tag: BytesStart<'_>) -> Result<(), VoTableError> {
        self.writer.write_event(XmlEvent::Empty(tag)).map_err(xml_err)
    }

    fn param(&mut self, name: &str, value: &AttrValue) -> Result<(), VoTableError> {
        let kind = value.kind();
        let text = cell_text(value);
        let mut tag = BytesStart::new("PARAM").with_attributes([("name", name), ("datatype", datatype(kind))]);
        if matches!(kind, ValueKind::String | ValueKind::Null) {
            tag.push_attribute(("arraysize", "*"));
        }
        if kind == ValueKind::Null {
            tag.push_attribute(("xtype", "null"));
        }
        tag.push_attribute(("value", text.as_str()));
        self.empty(tag)
    }

    fn field(&mut self, name: &str, kind: ValueKind, xtype: Option<&str>, utype: Option<&str>) -> Result<(), VoTableError> {
        let mut tag = BytesStart::new("FIELD").with_attributes([("name", name), ("datatype", datatype(kind))]);
        if matches!(kind, ValueKind::String | ValueKind::Null) {
            tag.push_attribute(("arraysize", "*"));
        }
        if let Some(xtype) = xtype {
            tag.push_attribute(("xtype", xtype));
        }
        if let Some(utype) = utype {
            tag.push_attribute(("utype", utype));
        }
        self.empty(tag)
    }

    fn cell(&mut self, text: &str) -> Result<(), VoTableError> {
        if text.is_empty() {
            return self.empty(BytesStart::new("TD"));
        }
        self.start(BytesStart::new("TD"))?;
        self.writer.write_event(XmlEvent::Text(BytesText::new(text))).map_err(xml_err)?;
        self.end("TD")
    }
}

fn write_table(catalogue: &Catalogue, events: &[Event], schema: &[(String, ValueKind)]) -> Result<String, VoTableError> {
    let mut out = TableWriter { writer: Writer::new_with_indent(Vec::new(), b' ', 2) };
    out.writer
        .write_event(XmlEvent::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))
        .map_err(xml_err)?;
    out.start(BytesStart::new("VOTABLE").with_attributes([("version", "1.4"), ("xmlns", VOTABLE_NS)]))?;
    out.start(BytesStart::new("RESOURCE"))?;
    out.start(BytesStart::new("TABLE").with_attributes([("name", catalogue.name.as_str())]))?;

    out.param("uuid", &catalogue.uuid.to_string().into())?;
    out.param("name", &catalogue.name.as_str().into())?;
    out.param("author", &catalogue.author.as_str().into())?;
    out.param("tags", &json_list(&catalogue.tags)?.into())?;
    out.start(BytesStart::new("GROUP").with_attributes([("name", ATTRIBUTES_GROUP)]))?;
    for (key, value) in &catalogue.attributes {
        out.param(key, value)?;
    }
    out.end("GROUP")?;

    out.field("uuid", ValueKind::String, None, None)?;
    out.field("start", ValueKind::String, Some("timestamp"), None)?;
    out.field("stop", ValueKind::String, Some("timestamp"), None)?;
    out.field("author", ValueKind::String, None, None)?;
    out.field("tags", ValueKind::String, Some("json"), None)?;
    out.field("products", ValueKind::String, Some("json"), None)?;
    out.field("rating", ValueKind::Integer, None, None)?;
    for (key, kind) in schema {
        let xtype = (*kind == ValueKind::Null).then_some("null");
        out.field(key, *kind, xtype, Some(ATTRIBUTE_UTYPE))?;
    }

    out.start(BytesStart::new("DATA"))?;
    out.start(BytesStart::new("TABLEDATA"))?;
    for event in events {
        out.start(BytesStart::new("TR"))?;
        out.cell(&event.uuid.to_string())?;
        out.cell(&format_iso(&event.start))?;
        out.cell(&format_iso(&event.stop))?;
        out.cell(&event.author)?;
        out.cell(&json_list(&event.tags)?)?;
        out.cell(&json_list(&event.products)?)?;
        out.cell(&event.rating.map(|r| r.to_string()).unwrap_or_default())?;
        for (key, _) in schema {
            out.cell(&event.attributes.get(key).map(cell_text).unwrap_or_default())?;
        }
        out.end("TR")?;
    }
    out.end("TABLEDATA")?;
    out.end("DATA")?;
    out.end("TABLE")?;
    out.end("RESOURCE")?;
    out.end("VOTABLE")?;

    String::from_utf8(out.writer.into_inner()).map_err(xml_err)
}

/// Export a catalogue and the events it references as VOTable XML.
///
/// Fails with [`VoTableError::Validation`] when events disagree on
/// attribute keys or on the value type of a key.
pub fn export_votable_str(db: &Db, catalogue: impl AsCatalogueId) -> Result<String, VoTableError> {
    let id = catalogue.catalogue_id();
    let catalogue = db.get_catalogue(id)?;
    let events = db.catalogue_events(id)?;
    let schema = attribute_schema(&events)?;
    write_table(&catalogue, &events, &schema)
}

pub fn export_votable_file(db: &Db, catalogue: impl AsCatalogueId, path: impl AsRef<Path>) -> Result<(), VoTableError> {
    let text = export_votable_str(db, catalogue)?;
    std::fs::write(path, text)?;
    Ok(())
}

// ---- Import ----

#[derive(Debug, Default)]
struct Column {
    name: String,
    datatype: String,
    xtype: Option<String>,
    attribute: bool,
}

#[derive(Debug, Default)]
struct Param {
    name: String,
    datatype: String,
    xtype: Option<String>,
    value: String,
}

#[derive(Debug, Default)]
struct ParsedTable {
    name: Option<String>,
    params: Vec<Param>,
    attribute_params: Vec<Param>,
    columns: Vec<Column>,
    rows: Vec<Vec<String>>,
}

fn attr(tag: &BytesStart<'_>, name: &[u8]) -> Result<Option<String>, VoTableError> {
    for attribute in tag.attributes() {
        let attribute = attribute.map_err(xml_err)?;
        if attribute.key.local_name().as_ref() == name {
            return Ok(Some(attribute.unescape_value().map_err(xml_err)?.into_owned()));
        }
    }
    Ok(None)
}

fn parse_table(text: &str) -> Result<ParsedTable, VoTableError> {
    let mut reader = Reader::from_str(text);
    reader.config_mut().trim_text(true);

    let mut table = ParsedTable::default();
    let mut in_table = false;
    let mut done = false;
    let mut group_depth = 0usize;
    let mut in_attributes = false;
    let mut row: Option<Vec<String>> = None;
    let mut cell: Option<String> = None;

    loop {
        let event = reader.read_event().map_err(xml_err)?;
        if done {
            if matches!(event, XmlEvent::Eof) {
                break;
            }
            continue;
        }
        match event {
            XmlEvent::Start(tag) | XmlEvent::Empty(tag) if !in_table => {
                if tag.local_name().as_ref() == b"TABLE" {
                    in_table = true;
                    table.name = attr(&tag, b"name")?;
                }
            }
            XmlEvent::Start(tag) => match tag.local_name().as_ref() {
                b"GROUP" => {
                    group_depth += 1;
                    if attr(&tag, b"name")?.as_deref() == Some(ATTRIBUTES_GROUP) {
                        in_attributes = true;
                    }
                }
                b"PARAM" => read_param(&tag, in_attributes, &mut table)?,
                b"FIELD" => read_field(&tag, &mut table)?,
                b"TR" => row = Some(Vec::new()),
                b"TD" => cell = Some(String::new()),
                _ => {}
            },
            XmlEvent::Empty(tag) => match tag.local_name().as_ref() {
                b"PARAM" => read_param(&tag, in_attributes, &mut table)?,
                b"FIELD" => read_field(&tag, &mut table)?,
                b"TD" => {
                    if let Some(row) = row.as_mut() {
                        row.push(String::new());
                    }
                }
                _ => {}
            },
            XmlEvent::Text(text) => {
                if let Some(cell) = cell.as_mut() {
                    cell.push_str(&text.unescape().map_err(xml_err)?);
                }
            }
            XmlEvent::CData(data) => {
                if let Some(cell) = cell.as_mut() {
                    cell.push_str(&String::from_utf8_lossy(&data.into_inner()));
                }
            }
            XmlEvent::End(tag) => match tag.local_name().as_ref() {
                b"GROUP" => {
                    group_depth = group_depth.saturating_sub(1);
                    if group_depth == 0 {
                        in_attributes = false;
                    }
                }
                b"TD" => {
                    if let (Some(row), Some(cell)) = (row.as_mut(), cell.take()) {
                        row.push(cell);
                    }
                }
                b"TR" => {
                    if let Some(row) = row.take() {
                        table.rows.push(row);
                    }
                }
                // Only the first table of the document is read.
                b"TABLE" => done = true,
                _ => {}
            },
            XmlEvent::Eof => break,
            _ => {}
        }
    }

    if !in_table {
        return Err(VoTableError::Parse("no TABLE element".into()));
    }
    Ok(table)
}

fn read_param(tag: &BytesStart<'_>, in_attributes: bool, table: &mut ParsedTable) -> Result<(), VoTableError> {
    let param = Param {
        name: attr(tag, b"name")?.unwrap_or_default(),
        datatype: attr(tag, b"datatype")?.unwrap_or_else(|| "char".into()),
        xtype: attr(tag, b"xtype")?,
        value: attr(tag, b"value")?.unwrap_or_default(),
    };
    if in_attributes {
        table.attribute_params.push(param);
    } else {
        table.params.push(param);
    }
    Ok(())
}

fn read_field(tag: &BytesStart<'_>, table: &mut ParsedTable) -> Result<(), VoTableError> {
    let name = match attr(tag, b"name")? {
        Some(name) => name,
        None => attr(tag, b"ID")?.unwrap_or_default(),
    };
    table.columns.push(Column {
        name,
        datatype: attr(tag, b"datatype")?.unwrap_or_else(|| "char".into()),
        xtype: attr(tag, b"xtype")?,
        attribute: attr(tag, b"utype")?.as_deref() == Some(ATTRIBUTE_UTYPE),
    });
    Ok(())
}

fn typed_value(datatype: &str, xtype: Option<&str>, text: &str) -> Result<AttrValue, VoTableError> {
    let text = text.trim();
    if xtype == Some("null") {
        return Ok(AttrValue::Null);
    }
    let bad = || VoTableError::Parse(format!("invalid {datatype} value '{text}'"));
    match datatype {
        "boolean" => match text {
            "" | "?" => Ok(AttrValue::Null),
            "true" | "T" | "t" | "1" => Ok(AttrValue::Bool(true)),
            "false" | "F" | "f" | "0" => Ok(AttrValue::Bool(false)),
            _ => Err(bad()),
        },
        "short" | "int" | "long" | "unsignedByte" => {
            if text.is_empty() {
                Ok(AttrValue::Null)
            } else {
                text.parse().map(AttrValue::Integer).map_err(|_| bad())
            }
        }
        "float" | "double" => {
            if text.is_empty() {
                Ok(AttrValue::Null)
            } else {
                // NaN is the VOTable null for floating columns.
                text.parse::<f64>()
                    .map(|v| if v.is_finite() { AttrValue::Float(v) } else { AttrValue::Null })
                    .map_err(|_| bad())
            }
        }
        _ => Ok(AttrValue::String(text.to_string())),
    }
}

fn parse_list(text: &str) -> Vec<String> {
    let text = text.trim();
    if text.is_empty() {
        return Vec::new();
    }
    serde_json::from_str(text)
        .unwrap_or_else(|_| text.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Fixed {
    Uuid,
    Start,
    Stop,
    Author,
    Tags,
    Products,
    Rating,
}

fn fixed_column(column: &Column) -> Option<Fixed> {
    if column.attribute {
        return None;
    }
    let normalized: String = column
        .name
        .chars()
        .filter(|c| !matches!(c, ' ' | '_' | '-'))
        .flat_map(char::to_lowercase)
        .collect();
    match normalized.as_str() {
        "uuid" => Some(Fixed::Uuid),
        "start" | "starttime" | "begin" => Some(Fixed::Start),
        "stop" | "stoptime" | "end" | "endtime" => Some(Fixed::Stop),
        "author" => Some(Fixed::Author),
        "tags" => Some(Fixed::Tags),
        "products" => Some(Fixed::Products),
        "rating" => Some(Fixed::Rating),
        _ => None,
    }
}

fn build_event(
    columns: &[(Option<Fixed>, &Column)],
    row: &[String],
    default_author: &str,
    line: usize,
) -> Result<Event, VoTableError> {
    let mut uuid = None;
    let mut start = None;
    let mut stop = None;
    let mut author = None;
    let mut tags = Vec::new();
    let mut products = Vec::new();
    let mut rating = None;
    let mut attributes = Attributes::new();

    for ((fixed, column), text) in columns.iter().zip(row) {
        match fixed {
            Some(Fixed::Uuid) => uuid = Uuid::parse_str(text.trim()).ok(),
            Some(Fixed::Start) => start = Some(parse_timestamp(text)?),
            Some(Fixed::Stop) => stop = Some(parse_timestamp(text)?),
            Some(Fixed::Author) => author = Some(text.clone()),
            Some(Fixed::Tags) => tags = parse_list(text),
            Some(Fixed::Products) => products = parse_list(text),
            Some(Fixed::Rating) => rating = typed_value("long", None, text)?.as_i64(),
            None => {
                let value = typed_value(&column.datatype, column.xtype.as_deref(), text)?;
                attributes.insert(column.name.clone(), value);
            }
        }
    }

    let (Some(start), Some(stop)) = (start, stop) else {
        return Err(VoTableError::Parse(format!("row {line} has no start/stop")));
    };
    Ok(Event {
        uuid: uuid.unwrap_or_else(Uuid::new_v4),
        start,
        stop,
        author: author.unwrap_or_else(|| default_author.to_string()),
        tags,
        products,
        rating,
        attributes,
    })
}

/// Import the first table of a VOTable document into `db`.
///
/// Events keep the identifiers stored in the table. The whole table is
/// validated before the store is touched, then committed as one
/// transaction. Returns the created catalogue.
pub fn import_votable_str(text: &str, db: &Db) -> Result<Catalogue, VoTableError> {
    let table = parse_table(text)?;
    let param = |name: &str| table.params.iter().find(|p| p.name == name).map(|p| p.value.clone());

    let name = param("name").or_else(|| table.name.clone()).unwrap_or_default();
    let author = param("author").unwrap_or_default();
    let columns: Vec<(Option<Fixed>, &Column)> = table.columns.iter().map(|c| (fixed_column(c), c)).collect();

    let events = table
        .rows
        .iter()
        .enumerate()
        .map(|(i, row)| build_event(&columns, row, &author, i + 1))
        .collect::<Result<Vec<_>, _>>()?;

    let mut attributes = BTreeMap::new();
    for p in &table.attribute_params {
        attributes.insert(p.name.clone(), typed_value(&p.datatype, p.xtype.as_deref(), &p.value)?);
    }
    let mut draft = CatalogueDraft::new(name, author)
        .tags(param("tags").map(|t| parse_list(&t)).unwrap_or_default())
        .attributes(attributes)
        .events(&events);
    if let Some(id) = param("uuid").filter(|id| !id.is_empty()) {
        draft = draft.id(id);
    }

    let catalogue = draft.build()?;

    let _scope = db.transaction();
    for event in &events {
        db.insert_event(event)?;
    }
    db.insert_catalogue(&catalogue)?;
    log::debug!("Imported catalogue {} with {} events", catalogue.name, events.len());
    Ok(catalogue)
}

pub fn import_votable_file(path: impl AsRef<Path>, db: &Db) -> Result<Catalogue, VoTableError> {
    let text = std::fs::read_to_string(path)?;
    import_votable_str(&text, db)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DbError;
    use crate::model::EventDraft;

    fn catalogue_with(db: &Db, attrs: [Attributes; 2]) -> Catalogue {
        let [a0, a1] = attrs;
        let e0 = db.create_event(EventDraft::new("2025-01-31", "2026-01-31", "Paul").attributes(a0)).unwrap();
        let e1 = db.create_event(EventDraft::new("2027-01-31", "2028-01-31", "Mike").attributes(a1)).unwrap();
        let cat = db
            .create_catalogue(CatalogueDraft::new("cat", "John").attribute("key3", 4).attribute("key4", 5))
            .unwrap();
        db.add_events(&cat, [&e0, &e1]).unwrap()
    }

    fn attrs(pairs: &[(&str, AttrValue)]) -> Attributes {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[test]
    fn test_export_different_attributes() {
        let db = Db::new();
        let cat = catalogue_with(
            &db,
            [attrs(&[("key0", 0.into()), ("key1", 1.into())]), attrs(&[("key1", 2.into()), ("key2", 3.into())])],
        );
        let err = export_votable_str(&db, &cat).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Export VOTable: not all attributes are present in all events ('key0', 'key2')"
        );
    }

    #[test]
    fn test_export_different_attribute_types() {
        let db = Db::new();
        let cat = catalogue_with(
            &db,
            [
                attrs(&[("key0", 0.into()), ("key1", 1.into())]),
                attrs(&[("key0", "foo".into()), ("key1", "bar".into())]),
            ],
        );
        let err = export_votable_str(&db, &cat).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Export VOTable: not all value types are identical for all events for attribute key0"
        );
    }

    #[test]
    fn test_single_missing_key_is_a_one_tuple() {
        let keys: BTreeSet<&str> = ["key9"].into_iter().collect();
        assert_eq!(key_tuple(&keys), "('key9',)");
    }

    #[test]
    fn test_export_import_round_trip() {
        let db = Db::new();
        let cat = catalogue_with(
            &db,
            [attrs(&[("key0", 0.into()), ("key1", 1.5.into())]), attrs(&[("key0", 2.into()), ("key1", 3.25.into())])],
        );
        let xml = export_votable_str(&db, &cat).unwrap();

        let copy = Db::new();
        let imported = import_votable_str(&xml, &copy).unwrap();
        assert_eq!(copy.events(), db.events());
        assert_eq!(copy.catalogues().len(), 1);
        assert_eq!(imported.name, cat.name);
        assert_eq!(imported.attributes, cat.attributes);
        assert_eq!(imported.events, cat.events);
    }

    #[test]
    fn test_failed_import_leaves_store_untouched() {
        let db = Db::new();
        let cat = catalogue_with(
            &db,
            [attrs(&[("key0", 0.into())]), attrs(&[("key0", 1.into())])],
        );
        let xml = export_votable_str(&db, &cat).unwrap().replace(&cat.uuid.to_string(), "nope");

        let copy = Db::new();
        let updates = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = updates.clone();
        copy.on_update(move |_, _| {
            counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        });
        let err = import_votable_str(&xml, &copy).unwrap_err();
        assert!(matches!(err, VoTableError::Db(DbError::InvalidId(_))), "got {err:?}");
        assert!(copy.events().is_empty());
        assert!(copy.catalogues().is_empty());
        assert_eq!(updates.load(std::sync::atomic::Ordering::SeqCst), 0);
    }

    #[test]
    fn test_attribute_named_like_fixed_field() {
        let db = Db::new();
        let cat = catalogue_with(&db, [attrs(&[("start", "x".into())]), attrs(&[("start", "y".into())])]);
        let xml = export_votable_str(&db, &cat).unwrap();
        let copy = Db::new();
        import_votable_str(&xml, &copy).unwrap();
        assert_eq!(copy.events(), db.events());
    }

    #[test]
    fn test_import_foreign_table() {
        let xml = r#"<?xml version="1.0"?>
<VOTABLE version="1.3" xmlns="http://www.ivoa.net/xml/VOTable/v1.3">
  <RESOURCE>
    <TABLE name="Dst_Li2020">
      <PARAM name="author" datatype="char" arraysize="*" value="someone@example.org"/>
      <FIELD name="Start Time" datatype="char" arraysize="*"/>
      <FIELD name="Stop Time" datatype="char" arraysize="*"/>
      <FIELD name="Dst" datatype="double"/>
      <DATA>
        <TABLEDATA>
          <TR><TD>2001-03-31T00:00:00</TD><TD>2001-04-01T12:00:00</TD><TD>-387</TD></TR>
          <TR><TD>2003-10-29T06:00:00.000</TD><TD>2003-10-30T00:00:00.000</TD><TD/></TR>
        </TABLEDATA>
      </DATA>
    </TABLE>
  </RESOURCE>
</VOTABLE>"#;
        let db = Db::new();
        let cat = import_votable_str(xml, &db).unwrap();
        assert_eq!(cat.name, "Dst_Li2020");
        assert_eq!(cat.events.len(), 2);
        let events = db.catalogue_events(&cat).unwrap();
        assert!(events.iter().all(|e| e.author == "someone@example.org"));
        assert_eq!(events[0].attributes["Dst"], AttrValue::Float(-387.0));
        assert_eq!(events[1].attributes["Dst"], AttrValue::Null);
    }

    #[test]
    fn test_import_rejects_document_without_table() {
        let err = import_votable_str("<VOTABLE/>", &Db::new()).unwrap_err();
        assert!(matches!(err, VoTableError::Parse(_)));
    }

    #[test]
    fn test_non_finite_cells_import_as_null() {
        assert_eq!(typed_value("double", None, "NaN").unwrap(), AttrValue::Null);
        assert_eq!(typed_value("float", None, "-inf").unwrap(), AttrValue::Null);
        assert_eq!(typed_value("double", None, "2.5").unwrap(), AttrValue::Float(2.5));
    }
}
