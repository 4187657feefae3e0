//! INI-style service declaration parser
//!
//! A declaration file holds one service: a `[Service]` header section,
//! one `[Instance <name>]` section per instance, and any number of
//! `[Dependency <owner>]` sections, where `<owner>` is an instance name or
//! the word `service` for a service-level group. Dependency sections are
//! indexed per owner in file order.

use std::collections::HashMap;

use crate::note::RestartOn;
use crate::path::SvcPath;

use super::{DepGroupDecl, GroupKind, InstanceDecl, MethodKind, ServiceDecl, UnitType};

/// Key-value pairs of one section; keys are uppercased, each key can
/// appear multiple times.
type Section = HashMap<String, Vec<String>>;

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("declaration has no [Service] section")]
    NoServiceSection,

    #[error("[Service] section has no Name")]
    NoServiceName,

    #[error("bad section header: {0}")]
    BadHeader(String),

    #[error("[Dependency {0}] names no such instance")]
    UnknownOwner(String),

    #[error("invalid value for {key}: {value}")]
    BadValue { key: String, value: String },

    #[error("invalid path: {0}")]
    BadPath(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Split a file into `(header, section)` pairs, preserving order and
/// allowing repeated headers.
fn split_sections(content: &str) -> Result<Vec<(String, Section)>, ParseError> {
    let mut out: Vec<(String, Section)> = Vec::new();

    for raw in content.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }

        if line.starts_with('[') {
            if !line.ends_with(']') {
                return Err(ParseError::BadHeader(line.to_string()));
            }
            let header = line[1..line.len() - 1].trim().to_string();
            out.push((header, Section::new()));
            continue;
        }

        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let Some((_, section)) = out.last_mut() else {
            // key-value before any section header
            continue;
        };
        section
            .entry(key.trim().to_uppercase())
            .or_default()
            .push(value.trim().to_string());
    }

    Ok(out)
}

fn first<'a>(section: &'a Section, key: &str) -> Option<&'a str> {
    section.get(key).and_then(|v| v.first()).map(|s| s.as_str())
}

fn parse_depgroup(section: &Section) -> Result<DepGroupDecl, ParseError> {
    let kind = match first(section, "KIND") {
        Some(s) => GroupKind::parse(s).ok_or_else(|| ParseError::BadValue {
            key: "Kind".into(),
            value: s.into(),
        })?,
        None => GroupKind::default(),
    };

    let restart_on = match first(section, "RESTARTON") {
        Some(s) => RestartOn::parse(s).ok_or_else(|| ParseError::BadValue {
            key: "RestartOn".into(),
            value: s.into(),
        })?,
        None => RestartOn::None,
    };

    let mut targets = Vec::new();
    for values in section.get("TARGETS").into_iter().flatten() {
        for word in values.split_whitespace() {
            targets.push(SvcPath::parse(word).map_err(|_| ParseError::BadPath(word.into()))?);
        }
    }

    Ok(DepGroupDecl {
        kind,
        restart_on,
        targets,
    })
}

/// Parse one declaration file into a [`ServiceDecl`].
pub fn parse_service_decl(content: &str) -> Result<ServiceDecl, ParseError> {
    let sections = split_sections(content)?;

    let (_, svc_section) = sections
        .iter()
        .find(|(h, _)| h == "Service")
        .ok_or(ParseError::NoServiceSection)?;

    let svc_name = first(svc_section, "NAME").ok_or(ParseError::NoServiceName)?;
    let svc_path =
        SvcPath::parse(svc_name).map_err(|_| ParseError::BadPath(svc_name.to_string()))?;
    if svc_path.is_instance() {
        return Err(ParseError::BadPath(svc_name.to_string()));
    }

    let mut decl = ServiceDecl::new(svc_path.clone());

    // Instances first, so dependency sections can resolve their owners.
    for (header, section) in &sections {
        let Some(inst_name) = header.strip_prefix("Instance ") else {
            continue;
        };
        let inst_name = inst_name.trim();
        if inst_name.is_empty() {
            return Err(ParseError::BadHeader(header.clone()));
        }

        let mut inst = InstanceDecl::new(SvcPath::instance(svc_path.svc_name(), inst_name));

        if let Some(t) = first(section, "TYPE") {
            inst.unit_type = UnitType::parse(t).ok_or_else(|| ParseError::BadValue {
                key: "Type".into(),
                value: t.into(),
            })?;
        }

        for (kind, key) in [
            (MethodKind::PreStart, "PRESTART"),
            (MethodKind::Start, "START"),
            (MethodKind::PostStart, "POSTSTART"),
            (MethodKind::Stop, "STOP"),
            (MethodKind::PostStop, "POSTSTOP"),
        ] {
            if let Some(cmd) = first(section, key) {
                inst.methods.insert(kind, cmd.to_string());
            }
        }

        decl.instances.push(inst);
    }

    for (header, section) in &sections {
        let Some(owner) = header.strip_prefix("Dependency ") else {
            continue;
        };
        let owner = owner.trim();
        let group = parse_depgroup(section)?;

        if owner == "service" {
            decl.depgroups.push(group);
        } else {
            let inst = decl
                .instances
                .iter_mut()
                .find(|i| i.path.inst_name() == Some(owner))
                .ok_or_else(|| ParseError::UnknownOwner(owner.to_string()))?;
            inst.depgroups.push(group);
        }
    }

    Ok(decl)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
# websocket tier
[Service]
Name=ws

[Instance main]
Type=notify
PreStart=/usr/bin/ws-prepare
Start=/usr/bin/wsd --foreground
Stop=/usr/bin/wsctl drain

[Dependency main]
Kind=require-all
RestartOn=restart
Targets=db:main log:main

[Dependency service]
Kind=optional-all
Targets=metrics
"#;

    #[test]
    fn test_parse_full_declaration() {
        let decl = parse_service_decl(SAMPLE).unwrap();
        assert_eq!(decl.path, SvcPath::service("ws"));
        assert_eq!(decl.instances.len(), 1);

        let inst = &decl.instances[0];
        assert_eq!(inst.path, SvcPath::instance("ws", "main"));
        assert_eq!(inst.unit_type, UnitType::Notify);
        assert_eq!(
            inst.methods.get(&MethodKind::Start).map(String::as_str),
            Some("/usr/bin/wsd --foreground")
        );
        assert_eq!(inst.depgroups.len(), 1);

        let dg = &inst.depgroups[0];
        assert_eq!(dg.kind, GroupKind::RequireAll);
        assert_eq!(dg.restart_on, RestartOn::Restart);
        assert_eq!(
            dg.targets,
            vec![
                SvcPath::instance("db", "main"),
                SvcPath::instance("log", "main")
            ]
        );

        assert_eq!(decl.depgroups.len(), 1);
        assert_eq!(decl.depgroups[0].kind, GroupKind::OptionalAll);
        assert_eq!(decl.depgroups[0].targets, vec![SvcPath::service("metrics")]);
    }

    #[test]
    fn test_parse_multiple_instances() {
        let decl = parse_service_decl(
            r#"
[Service]
Name=db

[Instance main]
Start=/usr/sbin/dbd

[Instance replica]
Start=/usr/sbin/dbd --replica
"#,
        )
        .unwrap();
        assert_eq!(decl.instances.len(), 2);
        assert_eq!(decl.instances[1].path, SvcPath::instance("db", "replica"));
    }

    #[test]
    fn test_parse_requires_service_section() {
        assert!(matches!(
            parse_service_decl("[Instance main]\nStart=/bin/true\n"),
            Err(ParseError::NoServiceSection)
        ));
    }

    #[test]
    fn test_parse_rejects_unknown_owner() {
        let res = parse_service_decl(
            r#"
[Service]
Name=db

[Dependency main]
Targets=log:main
"#,
        );
        assert!(matches!(res, Err(ParseError::UnknownOwner(_))));
    }

    #[test]
    fn test_parse_rejects_bad_kind() {
        let res = parse_service_decl(
            r#"
[Service]
Name=db

[Instance main]
Start=/bin/true

[Dependency main]
Kind=require-some
"#,
        );
        assert!(matches!(res, Err(ParseError::BadValue { .. })));
    }

    #[test]
    fn test_comments_and_blank_lines_ignored() {
        let decl = parse_service_decl(
            "# leading comment\n; another\n\n[Service]\nName=log\n\n[Instance main]\nStart=/usr/sbin/logd\n",
        )
        .unwrap();
        assert_eq!(decl.instances.len(), 1);
    }
}
