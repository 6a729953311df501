//! Format registry and dispatcher.
//!
//! The [`Registry`] holds one decoder per supported format in a fixed
//! order. [`Registry::parse`] picks a decoder (explicitly, or by asking each
//! one to sniff the file) and returns the decoded region tree. Decoding is
//! best effort: a decoder failure is logged and yields an empty tree, so the
//! caller only has to handle "no regions".

use crate::error::{Error, Result};
use crate::formats::{self, Decoder};
use crate::region::Region;
use bytes::Bytes;
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, warn};

/// Option values for one format, keyed by option id
pub type ParsingOptions = HashMap<String, String>;

/// Option values for all formats, keyed by format id
pub type OptionsMap = HashMap<String, ParsingOptions>;

/// Declaration of an option a decoder understands
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OptionDef {
    /// Option id, the key in [`ParsingOptions`]
    pub id: &'static str,
    /// Display name
    pub name: &'static str,
    /// What the option changes
    pub description: &'static str,
    /// Value used when the option is not set
    pub default: &'static str,
}

/// Result of decoding one buffer
#[derive(Debug, Clone)]
pub struct FileDom {
    /// The decoded buffer; region offsets index into it
    pub buffer: Bytes,
    /// Top-level regions, empty if nothing could be decoded
    pub regions: Vec<Region>,
    /// Id of the decoder that produced the regions
    pub format: Option<&'static str>,
}

impl FileDom {
    /// Returns the bytes covered by `region`
    pub fn slice(&self, region: &Region) -> &[u8] {
        let end = region.end.min(self.buffer.len());
        &self.buffer[region.start.min(end)..end]
    }
}

/// Configuration for a [`Registry`]
#[derive(Debug, Clone, Default)]
pub struct RegistryConfig {
    /// Option values passed to decoders
    pub options: OptionsMap,
}

impl RegistryConfig {
    /// Creates a config with no options set
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets one option of one format
    pub fn option(
        mut self,
        format: impl Into<String>,
        id: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.options
            .entry(format.into())
            .or_default()
            .insert(id.into(), value.into());
        self
    }
}

/// Ordered set of decoders plus the options passed to them
pub struct Registry {
    decoders: Vec<Box<dyn Decoder>>,
    options: OptionsMap,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("formats", &self.formats())
            .field("options", &self.options)
            .finish()
    }
}

impl Registry {
    /// Creates a registry with every built-in decoder
    pub fn new() -> Self {
        Self::with_config(RegistryConfig::default())
    }

    /// Creates a registry with every built-in decoder and custom options
    pub fn with_config(config: RegistryConfig) -> Self {
        Self {
            decoders: formats::builtin(),
            options: config.options,
        }
    }

    /// Creates a registry with no decoders
    pub fn empty() -> Self {
        Self {
            decoders: Vec::new(),
            options: OptionsMap::new(),
        }
    }

    /// Appends a decoder; it is sniffed after all earlier ones
    pub fn register(&mut self, decoder: impl Decoder + 'static) {
        self.decoders.push(Box::new(decoder));
    }

    /// Ids of the registered decoders in sniffing order
    pub fn formats(&self) -> Vec<&'static str> {
        self.decoders.iter().map(|d| d.id()).collect()
    }

    /// Looks up a decoder by id
    pub fn get(&self, id: &str) -> Option<&dyn Decoder> {
        self.decoders.iter().find(|d| d.id() == id).map(|d| d.as_ref())
    }

    /// Options declared by each decoder that declares any
    pub fn parsing_options(&self) -> Vec<(&'static str, Vec<OptionDef>)> {
        self.decoders
            .iter()
            .map(|d| (d.id(), d.parsing_options()))
            .filter(|(_, defs)| !defs.is_empty())
            .collect()
    }

    /// Replaces all option values
    pub fn set_parsing_options(&mut self, options: OptionsMap) {
        self.options = options;
    }

    /// Sets one option of one format
    pub fn set_option(&mut self, format: &str, id: &str, value: &str) {
        self.options
            .entry(format.to_string())
            .or_default()
            .insert(id.to_string(), value.to_string());
    }

    /// Options passed to `decoder`: declared defaults overlaid with the
    /// values set on the registry
    fn options_for(&self, decoder: &dyn Decoder) -> ParsingOptions {
        let mut options: ParsingOptions = decoder
            .parsing_options()
            .into_iter()
            .map(|def| (def.id.to_string(), def.default.to_string()))
            .collect();
        if let Some(set) = self.options.get(decoder.id()) {
            options.extend(set.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        options
    }

    /// Returns the first decoder whose sniff accepts the file
    pub fn select(&self, filename: &str, buffer: &[u8]) -> Option<&dyn Decoder> {
        let ext = extension(filename);
        self.decoders
            .iter()
            .find(|d| d.sniff(filename, &ext, buffer))
            .map(|d| d.as_ref())
    }

    /// Decodes `buffer`.
    ///
    /// With `forced_format`, that decoder is used outright and an unknown id
    /// fails with [`Error::UnknownFormat`]. Otherwise the first decoder whose
    /// sniff matches is used. No match, or a decoder failure, yields an
    /// empty region list.
    pub fn parse(
        &self,
        buffer: impl Into<Bytes>,
        filename: &str,
        forced_format: Option<&str>,
    ) -> Result<FileDom> {
        let buffer = buffer.into();

        let decoder = match forced_format {
            Some(id) => Some(self.get(id).ok_or_else(|| Error::unknown_format(id))?),
            None => self.select(filename, &buffer),
        };

        let Some(decoder) = decoder else {
            debug!("No decoder matched {}", filename);
            return Ok(FileDom {
                buffer,
                regions: Vec::new(),
                format: None,
            });
        };

        debug!("Selected decoder '{}' for {}", decoder.id(), filename);
        let regions = match decoder.parse(&buffer, &self.options_for(decoder)) {
            Ok(regions) => regions,
            Err(e) => {
                warn!("Decoder '{}' failed on {}: {}", decoder.id(), filename, e);
                Vec::new()
            }
        };

        Ok(FileDom {
            buffer,
            regions,
            format: Some(decoder.id()),
        })
    }

    /// Reads and decodes a file, sniffing by its name
    pub fn parse_file(&self, path: impl AsRef<Path>, forced_format: Option<&str>) -> Result<FileDom> {
        let path = path.as_ref();
        let data = std::fs::read(path).map_err(|e| Error::file_read(path, e))?;
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default();
        self.parse(data, name, forced_format)
    }
}

/// Lowercased extension of `filename`, or an empty string
pub fn extension(filename: &str) -> String {
    Path::new(filename)
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default()
}

/// Decodes a file with the built-in decoders
///
/// This is a convenience function that reads the file and decodes it.
pub fn decode_file(path: impl AsRef<Path>) -> Result<FileDom> {
    Registry::new().parse_file(path, None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::RegionKind;

    struct Always;

    impl Decoder for Always {
        fn id(&self) -> &'static str {
            "always"
        }

        fn name(&self) -> &'static str {
            "Always"
        }

        fn sniff(&self, _: &str, _: &str, _: &[u8]) -> bool {
            true
        }

        fn parse(&self, buffer: &Bytes, options: &ParsingOptions) -> Result<Vec<Region>> {
            if options.get("fail").map(String::as_str) == Some("yes") {
                return Err(Error::mismatch(0, "anything"));
            }
            Ok(vec![Region::new("all", RegionKind::General, 0, buffer.len())])
        }

        fn parsing_options(&self) -> Vec<OptionDef> {
            vec![OptionDef {
                id: "fail",
                name: "Fail",
                description: "Fail on purpose",
                default: "no",
            }]
        }
    }

    #[test]
    fn test_extension() {
        assert_eq!(extension("a/b/Setup.EXE"), "exe");
        assert_eq!(extension("archive.tar.gz"), "gz");
        assert_eq!(extension("README"), "");
    }

    #[test]
    fn test_builtin_order() {
        let registry = Registry::new();
        assert_eq!(
            registry.formats(),
            vec![
                "ico", "zip", "pe", "riff", "ttf", "mp3", "mp4", "asn1", "png", "jpeg", "gzip",
                "protobuf"
            ]
        );
    }

    #[test]
    fn test_forced_unknown_format_fails() {
        let registry = Registry::new();
        let err = registry.parse(vec![0u8; 4], "x.bin", Some("elf")).unwrap_err();
        assert!(matches!(err, Error::UnknownFormat { .. }));
    }

    #[test]
    fn test_no_match_is_empty() {
        let registry = Registry::new();
        let dom = registry
            .parse(b"plain text, nothing to see".to_vec(), "notes.txt", None)
            .unwrap();
        assert!(dom.regions.is_empty());
        assert_eq!(dom.format, None);
        assert_eq!(dom.buffer.len(), 26);
    }

    #[test]
    fn test_decoder_failure_is_empty() {
        let mut registry = Registry::empty();
        registry.register(Always);
        let dom = registry.parse(vec![1, 2, 3], "x", None).unwrap();
        assert_eq!(dom.regions.len(), 1);
        assert_eq!(dom.slice(&dom.regions[0]), &[1, 2, 3]);

        registry.set_option("always", "fail", "yes");
        let dom = registry.parse(vec![1, 2, 3], "x", None).unwrap();
        assert!(dom.regions.is_empty());
        assert_eq!(dom.format, Some("always"));
    }

    #[test]
    fn test_deeply_nested_input_is_empty() {
        let registry = Registry::new();
        let dom = registry
            .parse([0x30u8, 0x80].repeat(50_000), "deep.der", None)
            .unwrap();
        assert_eq!(dom.format, Some("asn1"));
        assert!(dom.regions.is_empty());
    }

    #[test]
    fn test_options_listing() {
        let registry = Registry::new();
        let options = registry.parsing_options();
        assert_eq!(options.len(), 1);
        assert_eq!(options[0].0, "zip");
        assert_eq!(options[0].1[0].id, "encoding");
    }

    #[test]
    fn test_config_builder() {
        let config = RegistryConfig::new().option("zip", "encoding", "latin1");
        let registry = Registry::with_config(config);
        let zip = registry.get("zip").unwrap();
        assert_eq!(
            registry.options_for(zip).get("encoding").map(String::as_str),
            Some("latin1")
        );
    }
}
