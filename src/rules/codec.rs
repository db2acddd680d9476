//! Translation between INI sections and [`Rule`] values.

use std::collections::BTreeSet;

use crate::endpoint::{EndpointKey, Flow};
use crate::store::{Scope, TypedValue, ValueKind};

use super::ini::IniSection;
use super::{
    DEFAULT_LOCATION, DeviceScope, FxBody, FxRule, MainRule, Membership, MultiRecord, Rule,
    RuleId, SwitchRecord, WriteBlock, clamp_quorum,
};

/// Keys the engine writes itself. Anything else in a section is user data
/// and survives rewrites untouched.
const OWNED_KEYS: &[&str] = &[
    "type",
    "fx_name",
    "device_name_pattern",
    "value_name",
    "dword_enable",
    "dword_disable",
    "hives",
    "flows",
    "subkey",
    "devices",
    "excluded_devices",
    "notes",
    "multi_write",
    "write_count",
    "decider_index",
    "quorum_threshold",
];

/// Whether `key` (lower-cased) is written by [`rule_entries`], including the
/// per-block `write{i}_*` family.
pub fn is_owned_key(key: &str) -> bool {
    if OWNED_KEYS.contains(&key) {
        return true;
    }
    let Some(rest) = key.strip_prefix("write") else {
        return false;
    };
    let digits = rest.chars().take_while(char::is_ascii_digit).count();
    digits > 0 && rest[digits..].starts_with('_')
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

fn list(section: &IniSection, key: &str) -> Vec<String> {
    section
        .get(key)
        .map(|text| {
            text.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn endpoint_set(items: impl IntoIterator<Item = String>) -> BTreeSet<EndpointKey> {
    items
        .into_iter()
        .filter_map(|s| EndpointKey::normalized(&s))
        .collect()
}

/// Declared scopes in order. Unknown names are ignored; none left means the
/// canonical order.
fn scopes(section: &IniSection) -> Vec<Scope> {
    let mut out = Vec::new();
    for scope in list(section, "hives").iter().filter_map(|s| s.parse::<Scope>().ok()) {
        if !out.contains(&scope) {
            out.push(scope);
        }
    }
    if out.is_empty() {
        out.extend(Scope::CANONICAL);
    }
    out
}

fn flows(section: &IniSection) -> Vec<Flow> {
    let mut out = Vec::new();
    for flow in list(section, "flows").iter().filter_map(|s| s.parse::<Flow>().ok()) {
        if !out.contains(&flow) {
            out.push(flow);
        }
    }
    if out.is_empty() {
        out.extend(Flow::ALL);
    }
    out
}

fn membership(section: &IniSection) -> Membership {
    Membership {
        devices: endpoint_set(list(section, "devices")),
        excluded: endpoint_set(list(section, "excluded_devices")),
    }
}

fn required<'a>(section: &'a IniSection, key: &str) -> Result<&'a str, String> {
    section.get(key).ok_or_else(|| format!("missing {key}"))
}

fn required_nonempty<'a>(section: &'a IniSection, key: &str) -> Result<&'a str, String> {
    let value = required(section, key)?;
    if value.is_empty() {
        return Err(format!("empty {key}"));
    }
    Ok(value)
}

fn integer(section: &IniSection, key: &str) -> Result<u32, String> {
    match TypedValue::decode(ValueKind::Integer, required(section, key)?) {
        Ok(TypedValue::Integer(v)) => Ok(v),
        Ok(_) => Err(format!("{key} is not an integer")),
        Err(e) => Err(format!("{key}: {e}")),
    }
}

fn location(section: &IniSection, key: &str) -> String {
    match section.get(key) {
        Some(text) if !text.is_empty() => text.to_string(),
        _ => DEFAULT_LOCATION.to_string(),
    }
}

fn switch_record(section: &IniSection) -> Result<SwitchRecord, String> {
    let record = SwitchRecord {
        value_name: required_nonempty(section, "value_name")?.to_ascii_lowercase(),
        location: location(section, "subkey"),
        enable: integer(section, "dword_enable")?,
        disable: integer(section, "dword_disable")?,
    };
    if record.enable == record.disable {
        return Err(format!(
            "dword_enable and dword_disable are both {}",
            record.enable
        ));
    }
    Ok(record)
}

fn write_block(section: &IniSection, i: usize) -> Result<WriteBlock, String> {
    let key = |suffix: &str| format!("write{i}_{suffix}");

    let scope = required_nonempty(section, &key("hive"))?
        .parse::<Scope>()
        .map_err(|e| format!("{}: {e}", key("hive")))?;
    let name = required_nonempty(section, &key("name"))?.to_ascii_lowercase();

    let kind_enable = match section.get(&key("type_enable")) {
        Some(t) if !t.is_empty() => t.parse::<ValueKind>().map_err(|e| format!("{}: {e}", key("type_enable")))?,
        _ => ValueKind::Integer,
    };
    let kind_disable = match section.get(&key("type_disable")) {
        Some(t) if !t.is_empty() => t.parse::<ValueKind>().map_err(|e| format!("{}: {e}", key("type_disable")))?,
        _ => kind_enable,
    };
    let enable = TypedValue::decode(kind_enable, required(section, &key("enable"))?)
        .map_err(|e| format!("{}: {e}", key("enable")))?;
    let disable = TypedValue::decode(kind_disable, required(section, &key("disable"))?)
        .map_err(|e| format!("{}: {e}", key("disable")))?;
    if enable == disable {
        return Err(format!("write{i} enable and disable payloads are identical"));
    }

    let device_scope = match section.get(&key("devices")) {
        None => DeviceScope::Universal,
        Some(text) => DeviceScope::only(endpoint_set(
            text.split(',').map(str::trim).map(str::to_string),
        )),
    };

    Ok(WriteBlock {
        scope,
        location: location(section, &key("subkey")),
        name,
        enable,
        disable,
        device_scope,
    })
}

fn multi_record(section: &IniSection, default_quorum: f64) -> Result<MultiRecord, String> {
    let count = match section.get("write_count") {
        Some(text) => text
            .parse::<usize>()
            .map_err(|e| format!("write_count: {e}"))?,
        None => 0,
    };
    if count == 0 {
        return Err("multi_write rule has no write blocks".to_string());
    }
    let blocks = (1..=count)
        .map(|i| write_block(section, i))
        .collect::<Result<Vec<_>, _>>()?;

    let decider_index = section
        .get("decider_index")
        .and_then(|t| t.parse::<usize>().ok())
        .unwrap_or(1)
        .clamp(1, count);
    let quorum_threshold = clamp_quorum(
        section
            .get("quorum_threshold")
            .and_then(|t| t.parse::<f64>().ok())
            .unwrap_or(default_quorum),
    );

    Ok(MultiRecord {
        decider_index,
        quorum_threshold,
        blocks,
    })
}

/// Interpret one section. The error string explains why it was skipped.
pub fn parse_rule(section: &IniSection, default_quorum: f64) -> Result<Rule, String> {
    let id = RuleId(section.name.clone());
    let notes = section.get("notes").unwrap_or_default().to_string();
    let kind = section.get("type").unwrap_or("main").to_ascii_lowercase();

    match kind.as_str() {
        "" | "main" => Ok(Rule::Main(MainRule {
            id,
            record: switch_record(section)?,
            scopes: scopes(section),
            flows: flows(section),
            membership: membership(section),
            notes,
        })),
        "fx" => {
            let fx_name = required_nonempty(section, "fx_name")?.to_string();
            let multi = section
                .get("multi_write")
                .is_some_and(|t| matches!(t.to_ascii_lowercase().as_str(), "1" | "true" | "yes"));
            let body = if multi {
                FxBody::Multi(multi_record(section, default_quorum)?)
            } else {
                FxBody::Legacy(switch_record(section)?)
            };
            Ok(Rule::Fx(FxRule {
                id,
                fx_name,
                device_name_pattern: section.get("device_name_pattern").unwrap_or_default().to_string(),
                scopes: scopes(section),
                flows: flows(section),
                membership: membership(section),
                notes,
                body,
            }))
        }
        other => Err(format!("unknown rule type {other:?}")),
    }
}

// ---------------------------------------------------------------------------
// Rendering
// ---------------------------------------------------------------------------

fn join<T: std::fmt::Display>(items: impl IntoIterator<Item = T>) -> String {
    items
        .into_iter()
        .map(|i| i.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

struct Entries(Vec<(String, String)>);

impl Entries {
    fn put(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.push((key.into(), value.into()));
    }
}

fn put_switch(out: &mut Entries, record: &SwitchRecord) {
    out.put("value_name", record.value_name.as_str());
    out.put("dword_enable", record.enable.to_string());
    out.put("dword_disable", record.disable.to_string());
    out.put("subkey", record.location.as_str());
}

fn put_common(out: &mut Entries, scopes: &[Scope], flows: &[Flow], membership: &Membership, notes: &str) {
    out.put("hives", join(scopes));
    out.put("flows", join(flows));
    if !notes.is_empty() {
        out.put("notes", notes);
    }
    out.put("devices", join(&membership.devices));
    if !membership.excluded.is_empty() {
        out.put("excluded_devices", join(&membership.excluded));
    }
}

/// Canonical `(key, value)` entries for a rule, in file order.
pub fn rule_entries(rule: &Rule) -> Vec<(String, String)> {
    let mut out = Entries(Vec::new());
    match rule {
        Rule::Main(r) => {
            put_switch(&mut out, &r.record);
            put_common(&mut out, &r.scopes, &r.flows, &r.membership, &r.notes);
        }
        Rule::Fx(r) => {
            out.put("type", "fx");
            out.put("fx_name", r.fx_name.as_str());
            out.put("device_name_pattern", r.device_name_pattern.as_str());
            match &r.body {
                FxBody::Legacy(record) => put_switch(&mut out, record),
                FxBody::Multi(m) => {
                    out.put("multi_write", "1");
                    out.put("write_count", m.blocks.len().to_string());
                    out.put("decider_index", m.decider_index.to_string());
                    out.put("quorum_threshold", format!("{:.2}", m.quorum_threshold));
                    for (n, block) in m.blocks.iter().enumerate() {
                        let i = n + 1;
                        out.put(format!("write{i}_hive"), block.scope.as_str());
                        out.put(format!("write{i}_subkey"), block.location.as_str());
                        out.put(format!("write{i}_name"), block.name.as_str());
                        out.put(format!("write{i}_type_enable"), block.enable.kind().as_str());
                        out.put(format!("write{i}_type_disable"), block.disable.kind().as_str());
                        out.put(format!("write{i}_enable"), block.enable.encode());
                        out.put(format!("write{i}_disable"), block.disable.encode());
                        match &block.device_scope {
                            DeviceScope::Universal => {}
                            DeviceScope::Nobody => out.put(format!("write{i}_devices"), ""),
                            DeviceScope::Only(keys) => out.put(format!("write{i}_devices"), join(keys)),
                        }
                    }
                }
            }
            put_common(&mut out, &r.scopes, &r.flows, &r.membership, &r.notes);
        }
    }
    out.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::ini::IniDocument;

    fn section(text: &str) -> IniSection {
        IniDocument::parse(text).sections.remove(0)
    }

    #[test]
    fn main_rule_defaults() {
        let rule = parse_rule(
            &section("[m]\nvalue_name = {ABC},3\ndword_enable = 0\ndword_disable = 1\n"),
            0.6,
        )
        .unwrap();
        let Rule::Main(m) = rule else { panic!("expected main rule") };
        assert_eq!(m.record.value_name, "{abc},3");
        assert_eq!(m.record.location, DEFAULT_LOCATION);
        assert_eq!(m.scopes, Scope::CANONICAL.to_vec());
        assert_eq!(m.flows, Flow::ALL.to_vec());
        assert!(m.membership.devices.is_empty());
    }

    #[test]
    fn main_rule_requires_distinct_payloads() {
        let err = parse_rule(
            &section("[m]\nvalue_name = x\ndword_enable = 1\ndword_disable = 1\n"),
            0.6,
        )
        .unwrap_err();
        assert!(err.contains("both 1"));
        assert!(parse_rule(&section("[m]\ndword_enable = 1\n"), 0.6).is_err());
    }

    #[test]
    fn multi_record_parses_tri_state_scoping_and_clamps_quorum() {
        let text = "[fx_bass]\ntype = fx\nfx_name = Bass Boost\nmulti_write = 1\nwrite_count = 3\n\
                    decider_index = 9\nquorum_threshold = 0.99\n\
                    write1_hive = HKLM\nwrite1_subkey = FxProperties\nwrite1_name = {G},1\n\
                    write1_type_enable = REG_DWORD\nwrite1_type_disable = REG_DWORD\nwrite1_enable = 1\nwrite1_disable = 0\n\
                    write2_hive = HKCU\nwrite2_name = {g},2\nwrite2_type_enable = REG_BINARY\n\
                    write2_enable = hex:01\nwrite2_disable = hex:00\nwrite2_devices =\n\
                    write3_hive = HKCU\nwrite3_name = {g},3\nwrite3_type_enable = REG_SZ\n\
                    write3_enable = on\nwrite3_disable = off\nwrite3_devices = {E}, {F}\n";
        let Rule::Fx(fx) = parse_rule(&section(text), 0.6).unwrap() else {
            panic!("expected fx rule")
        };
        let m = fx.multi().unwrap();
        assert_eq!(m.quorum_threshold, 0.95);
        assert_eq!(m.decider_index, 3);
        assert_eq!(m.blocks[0].device_scope, DeviceScope::Universal);
        assert_eq!(m.blocks[0].name, "{g},1");
        assert_eq!(m.blocks[1].device_scope, DeviceScope::Nobody);
        assert_eq!(m.blocks[1].enable, TypedValue::Binary(vec![1]));
        let e = EndpointKey::normalized("{e}").unwrap();
        assert!(m.blocks[2].device_scope.applies_to(&e));
        assert_eq!(m.blocks[2].disable, TypedValue::Text("off".into()));
    }

    #[test]
    fn missing_block_field_is_malformed() {
        let text = "[fx]\ntype = fx\nfx_name = X\nmulti_write = 1\nwrite_count = 1\nwrite1_hive = HKCU\n";
        assert!(parse_rule(&section(text), 0.6).unwrap_err().contains("write1_name"));
    }

    #[test]
    fn owned_keys_cover_block_family() {
        assert!(is_owned_key("write12_devices"));
        assert!(is_owned_key("devices"));
        assert!(!is_owned_key("writer_notes"));
        assert!(!is_owned_key("write_x"));
        assert!(!is_owned_key("author"));
    }

    #[test]
    fn rendered_entries_parse_back_to_the_same_rule() {
        let text = "[fx]\ntype = fx\nfx_name = Echo\nmulti_write = 1\nwrite_count = 1\n\
                    write1_hive = HKCU\nwrite1_name = {g},1\nwrite1_type_enable = REG_BINARY\n\
                    write1_type_disable = REG_BINARY\nwrite1_enable = hex:0a,0b\nwrite1_disable = hex:00\n\
                    write1_devices = {e}\ndevices = {e}\nexcluded_devices = {f}\n";
        let rule = parse_rule(&section(text), 0.6).unwrap();

        let mut doc = IniDocument::default();
        doc.push_section("fx", &rule_entries(&rule));
        let again = parse_rule(&doc.sections[0], 0.6).unwrap();
        assert_eq!(again, rule);
    }
}
