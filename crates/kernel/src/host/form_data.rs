//! Multipart form bodies assembled field by field.
//!
//! Rendering the body (or its content type) freezes the form: the
//! boundary is fixed at that point and later mutation is an error, so
//! the advertised content type always matches the bytes sent.

use std::collections::HashMap;

use rand::RngCore;

use crate::error::{HostError, HostResult};

/// An ordered multipart/form-data builder.
#[derive(Debug, Clone, Default)]
pub struct FormData {
    names: Vec<String>,
    values: HashMap<String, Vec<String>>,
    frozen: Option<Frozen>,
}

#[derive(Debug, Clone)]
struct Frozen {
    boundary: String,
    body: Vec<u8>,
}

impl FormData {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a value for `name`, keeping any existing ones.
    pub fn append(&mut self, name: &str, value: &str) -> HostResult<()> {
        self.check_open()?;
        if !self.values.contains_key(name) {
            self.names.push(name.to_owned());
        }
        self.values
            .entry(name.to_owned())
            .or_default()
            .push(value.to_owned());
        Ok(())
    }

    /// Replace all values for `name` with a single one.
    pub fn set(&mut self, name: &str, value: &str) -> HostResult<()> {
        self.check_open()?;
        if !self.values.contains_key(name) {
            self.names.push(name.to_owned());
        }
        self.values.insert(name.to_owned(), vec![value.to_owned()]);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.values
            .get(name)
            .and_then(|values| values.first())
            .map(String::as_str)
    }

    pub fn get_all(&self, name: &str) -> Vec<String> {
        self.values.get(name).cloned().unwrap_or_default()
    }

    pub fn has(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    pub fn delete(&mut self, name: &str) -> HostResult<()> {
        self.check_open()?;
        self.values.remove(name);
        self.names.retain(|existing| existing != name);
        Ok(())
    }

    /// Field names in first-insertion order.
    pub fn keys(&self) -> Vec<String> {
        self.names.clone()
    }

    /// All values, ordered by field then by insertion.
    pub fn values(&self) -> Vec<String> {
        self.entries().into_iter().map(|(_, value)| value).collect()
    }

    pub fn entries(&self) -> Vec<(String, String)> {
        let mut out = Vec::new();
        for name in &self.names {
            if let Some(values) = self.values.get(name) {
                for value in values {
                    out.push((name.clone(), value.clone()));
                }
            }
        }
        out
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen.is_some()
    }

    /// The `multipart/form-data` content type, boundary included.
    /// Freezes the form.
    pub fn content_type(&mut self) -> String {
        let frozen = self.freeze();
        format!("multipart/form-data; boundary={}", frozen.boundary)
    }

    /// The encoded multipart body. Freezes the form.
    pub fn to_buffer(&mut self) -> Vec<u8> {
        self.freeze().body.clone()
    }

    fn check_open(&self) -> HostResult<()> {
        if self.frozen.is_some() {
            return Err(HostError::invalid_argument(
                "form data already consumed, create a new instance to modify fields",
            ));
        }
        Ok(())
    }

    fn freeze(&mut self) -> &Frozen {
        let entries = self.entries();
        self.frozen.get_or_insert_with(|| {
            let boundary = random_boundary();
            let mut body = Vec::new();
            for (name, value) in entries {
                body.extend_from_slice(format!("--{boundary}\r\n").as_bytes());
                body.extend_from_slice(
                    format!(
                        "Content-Disposition: form-data; name=\"{}\"\r\n\r\n",
                        escape_quotes(&name)
                    )
                    .as_bytes(),
                );
                body.extend_from_slice(value.as_bytes());
                body.extend_from_slice(b"\r\n");
            }
            body.extend_from_slice(format!("--{boundary}--\r\n").as_bytes());
            Frozen { boundary, body }
        })
    }
}

fn random_boundary() -> String {
    let mut raw = [0u8; 30];
    rand::thread_rng().fill_bytes(&mut raw);
    hex::encode(raw)
}

fn escape_quotes(name: &str) -> String {
    name.replace('\\', "\\\\").replace('"', "\\\"")
}
