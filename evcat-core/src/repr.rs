//! Human-readable tree rendering of a store, used by `Debug for Db`.
//!
//! Containers that fit on one line are printed inline; others are expanded
//! with one child per line under `│` indent guides. Lists longer than
//! [`MAX_ITEMS`] show their head followed by a `... +N` marker.

use std::fmt::{self, Write};

use crate::db::{decode_catalogues, decode_events, Db};
use crate::model::{Catalogue, Event};
use crate::time::format_timestamp;
use crate::value::{AttrValue, Attributes};

const MAX_ITEMS: usize = 8;
const WIDTH: usize = 80;
const GUIDE: &str = "│   ";

enum Node {
    Scalar(String),
    List(Vec<Node>, usize),
    Map(Vec<(String, Node)>),
}

fn quote(s: &str) -> String {
    format!("'{}'", s.replace('\\', "\\\\").replace('\'', "\\'"))
}

fn str_node(s: &str) -> Node {
    Node::Scalar(quote(s))
}

fn list<I: IntoIterator<Item = Node>>(items: I) -> Node {
    let mut items: Vec<Node> = items.into_iter().collect();
    let more = items.len().saturating_sub(MAX_ITEMS);
    items.truncate(MAX_ITEMS);
    Node::List(items, more)
}

fn value_node(value: &AttrValue) -> Node {
    Node::Scalar(match value {
        AttrValue::Null => "None".to_string(),
        AttrValue::Bool(true) => "True".to_string(),
        AttrValue::Bool(false) => "False".to_string(),
        AttrValue::Integer(v) => v.to_string(),
        AttrValue::Float(v) => format!("{v:?}"),
        AttrValue::String(s) => quote(s),
    })
}

fn attributes_node(attributes: &Attributes) -> Node {
    Node::Map(attributes.iter().map(|(k, v)| (k.clone(), value_node(v))).collect())
}

fn strings_node(values: &[String]) -> Node {
    list(values.iter().map(|s| str_node(s)))
}

fn event_node(event: &Event) -> Node {
    Node::Map(vec![
        ("uuid".into(), str_node(&event.uuid.to_string())),
        ("start".into(), str_node(&format_timestamp(&event.start))),
        ("stop".into(), str_node(&format_timestamp(&event.stop))),
        ("author".into(), str_node(&event.author)),
        ("products".into(), strings_node(&event.products)),
        (
            "rating".into(),
            Node::Scalar(event.rating.map_or_else(|| "None".to_string(), |r| r.to_string())),
        ),
        ("tags".into(), strings_node(&event.tags)),
        ("attributes".into(), attributes_node(&event.attributes)),
    ])
}

fn catalogue_node(catalogue: &Catalogue) -> Node {
    Node::Map(vec![
        ("uuid".into(), str_node(&catalogue.uuid.to_string())),
        ("name".into(), str_node(&catalogue.name)),
        ("author".into(), str_node(&catalogue.author)),
        ("tags".into(), strings_node(&catalogue.tags)),
        ("attributes".into(), attributes_node(&catalogue.attributes)),
        ("events".into(), list(catalogue.events.iter().map(|id| str_node(&id.to_string())))),
    ])
}

impl Node {
    fn inline(&self) -> String {
        match self {
            Node::Scalar(s) => s.clone(),
            Node::List(items, more) => {
                let mut parts: Vec<String> = items.iter().map(Node::inline).collect();
                if *more > 0 {
                    parts.push(format!("... +{more}"));
                }
                format!("[{}]", parts.join(", "))
            }
            Node::Map(entries) => {
                let parts: Vec<String> = entries.iter().map(|(k, v)| format!("{}: {}", quote(k), v.inline())).collect();
                format!("{{{}}}", parts.join(", "))
            }
        }
    }

    fn render(&self, depth: usize, lead: &str, trailer: &str, out: &mut String) -> fmt::Result {
        let guides = GUIDE.repeat(depth);
        let inline = self.inline();
        let width = depth * 4 + lead.chars().count() + inline.chars().count() + trailer.len();
        let (open, close) = match self {
            Node::Scalar(_) => return writeln!(out, "{guides}{lead}{inline}{trailer}"),
            Node::List(..) => ("[", "]"),
            Node::Map(_) => ("{", "}"),
        };
        if width <= WIDTH {
            return writeln!(out, "{guides}{lead}{inline}{trailer}");
        }
        writeln!(out, "{guides}{lead}{open}")?;
        match self {
            Node::List(items, more) => {
                for (i, item) in items.iter().enumerate() {
                    let last = i + 1 == items.len() && *more == 0;
                    item.render(depth + 1, "", if last { "" } else { "," }, out)?;
                }
                if *more > 0 {
                    writeln!(out, "{}... +{more}", GUIDE.repeat(depth + 1))?;
                }
            }
            Node::Map(entries) => {
                for (i, (key, value)) in entries.iter().enumerate() {
                    let last = i + 1 == entries.len();
                    value.render(depth + 1, &format!("{}: ", quote(key)), if last { "" } else { "," }, out)?;
                }
            }
            Node::Scalar(_) => {}
        }
        writeln!(out, "{guides}{close}{trailer}")
    }
}

impl fmt::Debug for Db {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let snapshot = self.snapshot();
        let root = Node::Map(vec![
            ("events".into(), list(decode_events(&snapshot).values().map(event_node))),
            ("catalogues".into(), list(decode_catalogues(&snapshot).values().map(catalogue_node))),
        ]);
        let mut out = String::new();
        root.render(0, "", "", &mut out)?;
        f.write_str(out.trim_end_matches('\n'))
    }
}
