//! Staging an identifier into the simulator's YAML configuration.
//!
//! The document is read, mutated as a `serde_yaml::Value` and rewritten
//! wholesale, then read back to confirm the identifier landed. Sections the
//! panel does not know about are carried through untouched.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::{PanelError, PanelResult};
use crate::identifier::Msin;
use crate::types::{CountryCode, NetworkCode};

/// Optional endpoint addresses written alongside the identifier.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointOverrides {
    #[serde(default)]
    pub gnb_control_ip: Option<String>,
    #[serde(default)]
    pub gnb_data_ip: Option<String>,
    #[serde(default)]
    pub amf_ip: Option<String>,
}

impl EndpointOverrides {
    /// Fields set on `self` win; unset ones fall back to `defaults`.
    pub fn merged_over(&self, defaults: &EndpointOverrides) -> EndpointOverrides {
        EndpointOverrides {
            gnb_control_ip: self
                .gnb_control_ip
                .clone()
                .or_else(|| defaults.gnb_control_ip.clone()),
            gnb_data_ip: self
                .gnb_data_ip
                .clone()
                .or_else(|| defaults.gnb_data_ip.clone()),
            amf_ip: self.amf_ip.clone().or_else(|| defaults.amf_ip.clone()),
        }
    }
}

/// Everything one session writes into the configuration document.
#[derive(Debug, Clone, PartialEq)]
pub struct StagedIdentity {
    pub msin: Msin,
    pub country: Option<CountryCode>,
    pub network: Option<NetworkCode>,
    pub overrides: EndpointOverrides,
}

impl StagedIdentity {
    pub fn msin_only(msin: Msin) -> Self {
        Self {
            msin,
            country: None,
            network: None,
            overrides: EndpointOverrides::default(),
        }
    }
}

/// Writes a session's identity into the external configuration.
#[async_trait]
pub trait ConfigPatcher: Send + Sync {
    async fn apply(&self, identity: &StagedIdentity) -> PanelResult<()>;

    /// The identifier currently staged in the document, if it can be read.
    async fn current_identifier(&self) -> PanelResult<Option<Msin>> {
        Ok(None)
    }
}

/// Patcher for PacketRusher's `config.yml`.
pub struct YamlConfigPatcher {
    path: PathBuf,
    defaults: EndpointOverrides,
    write_lock: Mutex<()>,
}

impl YamlConfigPatcher {
    pub fn new(path: impl Into<PathBuf>, defaults: EndpointOverrides) -> Self {
        Self {
            path: path.into(),
            defaults,
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn load(&self) -> PanelResult<Value> {
        let raw = tokio::fs::read_to_string(&self.path).await.map_err(|e| {
            PanelError::Configuration(format!("cannot read {}: {}", self.path.display(), e))
        })?;
        serde_yaml::from_str(&raw).map_err(|e| {
            PanelError::Configuration(format!("cannot parse {}: {}", self.path.display(), e))
        })
    }
}

#[async_trait]
impl ConfigPatcher for YamlConfigPatcher {
    async fn apply(&self, identity: &StagedIdentity) -> PanelResult<()> {
        let _guard = self.write_lock.lock().await;

        let mut doc = self.load().await?;
        let overrides = identity.overrides.merged_over(&self.defaults);
        patch_document(&mut doc, identity, &overrides)?;

        let rendered = serde_yaml::to_string(&doc).map_err(|e| {
            PanelError::Configuration(format!("cannot render configuration: {e}"))
        })?;
        tokio::fs::write(&self.path, rendered).await.map_err(|e| {
            PanelError::Configuration(format!("cannot write {}: {}", self.path.display(), e))
        })?;

        let written = read_msin(&self.load().await?);
        if written.as_deref() != Some(identity.msin.as_str()) {
            return Err(PanelError::Configuration(format!(
                "read-back mismatch: expected msin {}, found {:?}",
                identity.msin, written
            )));
        }

        info!(
            path = %self.path.display(),
            msin = %identity.msin,
            "staged identifier into simulator configuration"
        );
        Ok(())
    }

    async fn current_identifier(&self) -> PanelResult<Option<Msin>> {
        let doc = self.load().await?;
        Ok(read_msin(&doc).and_then(|raw| Msin::parse(&raw).ok()))
    }
}

/// Apply `identity` and `overrides` to a parsed document.
pub fn patch_document(
    doc: &mut Value,
    identity: &StagedIdentity,
    overrides: &EndpointOverrides,
) -> PanelResult<()> {
    let ue = doc
        .get_mut("ue")
        .filter(|ue| ue.is_mapping())
        .ok_or_else(|| PanelError::Configuration("missing `ue` section".to_string()))?;

    set_str(ue, "msin", identity.msin.as_str());

    if identity.country.is_some() || identity.network.is_some() {
        if let Some(hplmn) = child_mapping(ue, "hplmn") {
            set_plmn(hplmn, identity);
        }
        if let Some(plmn) = doc
            .get_mut("gnodeb")
            .and_then(|gnb| gnb.get_mut("plmnlist"))
        {
            set_plmn(plmn, identity);
        }
    }

    if let Some(gnb) = doc.get_mut("gnodeb").filter(|g| g.is_mapping()) {
        if let Some(ip) = &overrides.gnb_control_ip {
            if let Some(ctrl) = child_mapping(gnb, "controlif") {
                set_str(ctrl, "ip", ip);
            }
        }
        if let Some(ip) = &overrides.gnb_data_ip {
            if let Some(data) = child_mapping(gnb, "dataif") {
                set_str(data, "ip", ip);
            }
        }
    }

    if let Some(ip) = &overrides.amf_ip {
        match doc.get_mut("amfif") {
            Some(Value::Sequence(list)) => {
                if let Some(first) = list.first_mut() {
                    set_str(first, "ip", ip);
                } else {
                    let mut entry = Value::Mapping(Mapping::new());
                    set_str(&mut entry, "ip", ip);
                    list.push(entry);
                }
            }
            Some(amf) if amf.is_mapping() => set_str(amf, "ip", ip),
            _ => debug!("no `amfif` section, skipping AMF override"),
        }
    }

    Ok(())
}

fn set_plmn(target: &mut Value, identity: &StagedIdentity) {
    if let Some(mcc) = &identity.country {
        set_str(target, "mcc", mcc.as_str());
    }
    if let Some(mnc) = &identity.network {
        set_str(target, "mnc", mnc.as_str());
    }
}

fn set_str(target: &mut Value, key: &str, value: &str) {
    if let Some(map) = target.as_mapping_mut() {
        map.insert(Value::String(key.to_string()), Value::String(value.to_string()));
    }
}

/// Get `parent[key]`, inserting an empty mapping when absent.
fn child_mapping<'a>(parent: &'a mut Value, key: &str) -> Option<&'a mut Value> {
    let map = parent.as_mapping_mut()?;
    let child = map
        .entry(Value::String(key.to_string()))
        .or_insert(Value::Mapping(Mapping::new()));
    if child.is_mapping() { Some(child) } else { None }
}

fn read_msin(doc: &Value) -> Option<String> {
    match doc.get("ue")?.get("msin")? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
