//! Per-exporter template state for NetFlow v9 and IPFIX.
//!
//! Each exporter gets its own `netflow_parser` scope, which decodes data
//! records, next to a [`TemplateSystem`] that tracks which template ids are
//! live and the sampler rates announced in options data. Both are dropped
//! together when the exporter is evicted.

use netflow_parser::scoped_parser::AutoScopedParser;
use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct TemplateField {
    pub(crate) field_type: u16,
    /// `u16::MAX` marks an IPFIX variable-length field.
    pub(crate) length: u16,
    pub(crate) enterprise: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TemplateKind {
    Data,
    Options,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Template {
    pub(crate) kind: TemplateKind,
    /// Leading scope fields of an options template.
    pub(crate) scope_count: usize,
    pub(crate) fields: Vec<TemplateField>,
}

impl Template {
    /// Smallest encoding of one record; used to tell records from set padding.
    pub(crate) fn min_record_len(&self) -> usize {
        self.fields
            .iter()
            .map(|f| if f.length == u16::MAX { 1 } else { f.length as usize })
            .sum()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct TemplateKey {
    version: u16,
    domain: u32,
    template_id: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct SamplerKey {
    version: u16,
    domain: u32,
    sampler_id: u64,
}

/// Templates and sampler rates learned from one exporter, scoped by
/// version and source id / observation domain.
#[derive(Debug, Default)]
pub(crate) struct TemplateSystem {
    templates: HashMap<TemplateKey, Template>,
    sampling: HashMap<SamplerKey, u64>,
}

impl TemplateSystem {
    pub(crate) fn insert(&mut self, version: u16, domain: u32, template_id: u16, template: Template) {
        self.templates.insert(
            TemplateKey {
                version,
                domain,
                template_id,
            },
            template,
        );
    }

    pub(crate) fn withdraw(&mut self, version: u16, domain: u32, template_id: u16) {
        self.templates.remove(&TemplateKey {
            version,
            domain,
            template_id,
        });
    }

    pub(crate) fn get(&self, version: u16, domain: u32, template_id: u16) -> Option<&Template> {
        self.templates.get(&TemplateKey {
            version,
            domain,
            template_id,
        })
    }

    pub(crate) fn len(&self) -> usize {
        self.templates.len()
    }

    pub(crate) fn set_sampling_rate(&mut self, version: u16, domain: u32, sampler_id: u64, rate: u64) {
        self.sampling.insert(
            SamplerKey {
                version,
                domain,
                sampler_id,
            },
            rate,
        );
    }

    pub(crate) fn sampling_rate(&self, version: u16, domain: u32, sampler_id: u64) -> Option<u64> {
        self.sampling
            .get(&SamplerKey {
                version,
                domain,
                sampler_id,
            })
            .copied()
    }
}

pub(crate) struct ExporterTemplates {
    pub(crate) parser: AutoScopedParser,
    pub(crate) system: TemplateSystem,
    last_used: u64,
}

/// Exporter-keyed parser scopes and template systems with
/// least-recently-used eviction.
///
/// A capacity of 0 disables the bound.
pub(crate) struct TemplateCache {
    systems: HashMap<IpAddr, ExporterTemplates>,
    capacity: usize,
    tick: u64,
    evictions: u64,
}

impl TemplateCache {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            systems: HashMap::new(),
            capacity,
            tick: 0,
            evictions: 0,
        }
    }

    pub(crate) fn exporter_mut(&mut self, exporter: IpAddr) -> &mut ExporterTemplates {
        self.tick = self.tick.wrapping_add(1);
        let tick = self.tick;

        if self.capacity > 0
            && self.systems.len() >= self.capacity
            && !self.systems.contains_key(&exporter)
        {
            self.evict_least_recently_used();
        }

        let entry = self
            .systems
            .entry(exporter)
            .or_insert_with(|| ExporterTemplates {
                parser: AutoScopedParser::new(),
                system: TemplateSystem::default(),
                last_used: tick,
            });
        entry.last_used = tick;
        entry
    }

    #[cfg(test)]
    pub(crate) fn get(&self, exporter: &IpAddr) -> Option<&TemplateSystem> {
        self.systems.get(exporter).map(|entry| &entry.system)
    }

    pub(crate) fn len(&self) -> usize {
        self.systems.len()
    }

    /// Templates held across all exporters.
    pub(crate) fn template_count(&self) -> usize {
        self.systems.values().map(|entry| entry.system.len()).sum()
    }

    pub(crate) fn evictions(&self) -> u64 {
        self.evictions
    }

    fn evict_least_recently_used(&mut self) {
        let oldest = self
            .systems
            .iter()
            .min_by_key(|(_, entry)| entry.last_used)
            .map(|(ip, _)| *ip);
        if let Some(ip) = oldest {
            self.systems.remove(&ip);
            self.evictions += 1;
            tracing::debug!("evicted template state of exporter {}", ip);
        }
    }
}

impl fmt::Debug for TemplateCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TemplateCache")
            .field("exporters", &self.systems.len())
            .field("templates", &self.template_count())
            .field("capacity", &self.capacity)
            .field("evictions", &self.evictions)
            .finish_non_exhaustive()
    }
}
