use std::collections::HashMap;

type Fields = HashMap<Vec<u8>, Vec<u8>>;

/// The in-memory hash index: key → field → value.
#[derive(Default)]
pub struct HashIndex {
    records: HashMap<Vec<u8>, Fields>,
}

impl HashIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets a field, overwriting an existing value. Returns 1 when the
    /// field was newly created, 0 when it was overwritten.
    pub fn hset(&mut self, key: &[u8], field: Vec<u8>, value: Vec<u8>) -> usize {
        let fields = self.records.entry(key.to_vec()).or_default();
        match fields.insert(field, value) {
            Some(_) => 0,
            None => 1,
        }
    }

    /// Sets a field only if it does not exist yet. Returns 1 on create.
    pub fn hset_nx(&mut self, key: &[u8], field: Vec<u8>, value: Vec<u8>) -> usize {
        let fields = self.records.entry(key.to_vec()).or_default();
        if fields.contains_key(&field) {
            return 0;
        }
        fields.insert(field, value);
        1
    }

    pub fn hget(&self, key: &[u8], field: &[u8]) -> Option<&[u8]> {
        self.records
            .get(key)
            .and_then(|fields| fields.get(field))
            .map(|v| v.as_slice())
    }

    /// All fields and values, interleaved. Order is unspecified.
    pub fn hget_all(&self, key: &[u8]) -> Vec<Vec<u8>> {
        let Some(fields) = self.records.get(key) else {
            return Vec::new();
        };
        let mut out = Vec::with_capacity(fields.len() * 2);
        for (field, value) in fields {
            out.push(field.clone());
            out.push(value.clone());
        }
        out
    }

    /// Deletes a field. Returns 1 when it existed.
    pub fn hdel(&mut self, key: &[u8], field: &[u8]) -> usize {
        match self.records.get_mut(key) {
            Some(fields) => match fields.remove(field) {
                Some(_) => 1,
                None => 0,
            },
            None => 0,
        }
    }

    pub fn hkey_exists(&self, key: &[u8]) -> bool {
        self.records.contains_key(key)
    }

    pub fn hexists(&self, key: &[u8], field: &[u8]) -> bool {
        self.records
            .get(key)
            .map_or(false, |fields| fields.contains_key(field))
    }

    pub fn hlen(&self, key: &[u8]) -> usize {
        self.records.get(key).map_or(0, |fields| fields.len())
    }

    pub fn hkeys(&self, key: &[u8]) -> Vec<Vec<u8>> {
        self.records
            .get(key)
            .map_or_else(Vec::new, |fields| fields.keys().cloned().collect())
    }

    pub fn hvals(&self, key: &[u8]) -> Vec<Vec<u8>> {
        self.records
            .get(key)
            .map_or_else(Vec::new, |fields| fields.values().cloned().collect())
    }

    pub fn hclear(&mut self, key: &[u8]) {
        self.records.remove(key);
    }
}
