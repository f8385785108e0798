//! Per-shard checkpoint tensor layout.
//!
//! A shard of variable `v` emits nine tensors: keys, values, versions
//! and freqs for admitted ids; keys, versions and freqs for filtered
//! (shadow) ids; and two offset vectors giving the per-sub-partition
//! start indices. Entries are grouped into `SAVED_PARTITION_NUM`
//! sub-partitions by id so a restore with a different shard count can
//! seek straight to its ranges. The tensor list of a bundle is sorted by
//! name; consumers depend on that order.

use crate::error::{Error, Result};

/// Number of sub-partitions entries are grouped into inside one shard.
pub const SAVED_PARTITION_NUM: usize = 1000;

/// Sub-partition of an id. The u64 cast keeps negative ids stable.
pub fn sub_partition(id: i64) -> usize {
    ((id as u64) % SAVED_PARTITION_NUM as u64) as usize
}

#[derive(Debug, Clone, PartialEq)]
pub enum TensorData {
    F32(Vec<f32>),
    I64(Vec<i64>),
    I32(Vec<i32>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    pub name: String,
    pub shape: Vec<usize>,
    pub data: TensorData,
}

/// One shard's worth of entries. `values` is row-major
/// `[keys.len(), value_len]` and stays empty for the filtered group.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ShardEntries {
    pub keys: Vec<i64>,
    pub values: Vec<f32>,
    pub versions: Vec<i64>,
    pub freqs: Vec<i64>,
}

impl ShardEntries {
    pub fn push(&mut self, key: i64, value: &[f32], version: i64, freq: i64) {
        self.keys.push(key);
        self.values.extend_from_slice(value);
        self.versions.push(version);
        self.freqs.push(freq);
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Reorders entries by (sub-partition, id) and returns the int32
    /// offset vector of length `SAVED_PARTITION_NUM + 1`.
    fn sort_into_partitions(&mut self, value_len: usize) -> Vec<i32> {
        let n = self.keys.len();
        let mut order: Vec<usize> = (0..n).collect();
        order.sort_by_key(|&i| (sub_partition(self.keys[i]), self.keys[i]));

        let mut sorted = ShardEntries::default();
        sorted.keys.reserve(n);
        sorted.values.reserve(self.values.len());
        for &i in &order {
            let row = if self.values.is_empty() {
                &[][..]
            } else {
                &self.values[i * value_len..(i + 1) * value_len]
            };
            sorted.push(self.keys[i], row, self.versions[i], self.freqs[i]);
        }
        *self = sorted;

        let mut offsets = vec![0i32; SAVED_PARTITION_NUM + 1];
        for &key in &self.keys {
            offsets[sub_partition(key) + 1] += 1;
        }
        for p in 0..SAVED_PARTITION_NUM {
            offsets[p + 1] += offsets[p];
        }
        offsets
    }
}

/// An ordered set of named tensors; one shard produces one bundle.
#[derive(Debug, Clone, Default)]
pub struct CheckpointBundle {
    tensors: Vec<Tensor>,
}

impl CheckpointBundle {
    pub fn tensors(&self) -> &[Tensor] {
        &self.tensors
    }

    pub fn tensor(&self, name: &str) -> Option<&Tensor> {
        self.tensors
            .binary_search_by(|t| t.name.as_str().cmp(name))
            .ok()
            .map(|i| &self.tensors[i])
    }

    fn i64_tensor(&self, name: &str) -> Result<&[i64]> {
        match self.tensor(name).map(|t| &t.data) {
            Some(TensorData::I64(v)) => Ok(v),
            Some(_) => Err(Error::invalid(format!("tensor {name} has the wrong dtype"))),
            None => Err(Error::invalid(format!("bundle is missing tensor {name}"))),
        }
    }

    fn f32_tensor(&self, name: &str) -> Result<(&[usize], &[f32])> {
        match self.tensor(name) {
            Some(Tensor {
                shape,
                data: TensorData::F32(v),
                ..
            }) => Ok((shape, v)),
            Some(_) => Err(Error::invalid(format!("tensor {name} has the wrong dtype"))),
            None => Err(Error::invalid(format!("bundle is missing tensor {name}"))),
        }
    }
}

fn shard_prefix(var_name: &str, partition_id: usize) -> String {
    format!("{var_name}/part_{partition_id}")
}

/// Assembles the nine tensors of one shard. Entries are regrouped by
/// sub-partition; the bundle comes back sorted by tensor name.
pub fn build_shard(
    var_name: &str,
    partition_id: usize,
    value_len: usize,
    mut admitted: ShardEntries,
    mut filtered: ShardEntries,
) -> CheckpointBundle {
    let prefix = shard_prefix(var_name, partition_id);
    let offsets = admitted.sort_into_partitions(value_len);
    let filter_offsets = filtered.sort_into_partitions(value_len);

    let n = admitted.len();
    let filtered_len = filtered.len();
    let mut tensors = vec![
        Tensor {
            name: format!("{prefix}-keys"),
            shape: vec![n],
            data: TensorData::I64(admitted.keys),
        },
        Tensor {
            name: format!("{prefix}-values"),
            shape: vec![n, value_len],
            data: TensorData::F32(admitted.values),
        },
        Tensor {
            name: format!("{prefix}-versions"),
            shape: vec![n],
            data: TensorData::I64(admitted.versions),
        },
        Tensor {
            name: format!("{prefix}-freqs"),
            shape: vec![n],
            data: TensorData::I64(admitted.freqs),
        },
        Tensor {
            name: format!("{prefix}-keys_filtered"),
            shape: vec![filtered_len],
            data: TensorData::I64(filtered.keys),
        },
        Tensor {
            name: format!("{prefix}-versions_filtered"),
            shape: vec![filtered_len],
            data: TensorData::I64(filtered.versions),
        },
        Tensor {
            name: format!("{prefix}-freqs_filtered"),
            shape: vec![filtered_len],
            data: TensorData::I64(filtered.freqs),
        },
        Tensor {
            name: format!("{prefix}-partition_offset"),
            shape: vec![SAVED_PARTITION_NUM + 1],
            data: TensorData::I32(offsets),
        },
        Tensor {
            name: format!("{prefix}-partition_filter_offset"),
            shape: vec![SAVED_PARTITION_NUM + 1],
            data: TensorData::I32(filter_offsets),
        },
    ];
    tensors.sort_by(|a, b| a.name.cmp(&b.name));
    CheckpointBundle { tensors }
}

/// Reads one shard back out of a bundle.
pub fn parse_shard(
    bundle: &CheckpointBundle,
    var_name: &str,
    partition_id: usize,
) -> Result<(ShardEntries, ShardEntries)> {
    let prefix = shard_prefix(var_name, partition_id);

    let keys = bundle.i64_tensor(&format!("{prefix}-keys"))?;
    let (shape, values) = bundle.f32_tensor(&format!("{prefix}-values"))?;
    if shape.len() != 2 || shape[0] != keys.len() || shape[0] * shape[1] != values.len() {
        return Err(Error::invalid(format!(
            "values tensor of {prefix} has shape {shape:?} for {} keys",
            keys.len()
        )));
    }
    let versions = bundle.i64_tensor(&format!("{prefix}-versions"))?;
    let freqs = bundle.i64_tensor(&format!("{prefix}-freqs"))?;
    if versions.len() != keys.len() || freqs.len() != keys.len() {
        return Err(Error::invalid(format!("ragged shard {prefix}")));
    }

    let admitted = ShardEntries {
        keys: keys.to_vec(),
        values: values.to_vec(),
        versions: versions.to_vec(),
        freqs: freqs.to_vec(),
    };

    let fkeys = bundle.i64_tensor(&format!("{prefix}-keys_filtered"))?;
    let fversions = bundle.i64_tensor(&format!("{prefix}-versions_filtered"))?;
    let ffreqs = bundle.i64_tensor(&format!("{prefix}-freqs_filtered"))?;
    if fversions.len() != fkeys.len() || ffreqs.len() != fkeys.len() {
        return Err(Error::invalid(format!("ragged filtered shard {prefix}")));
    }
    let filtered = ShardEntries {
        keys: fkeys.to_vec(),
        values: Vec::new(),
        versions: fversions.to_vec(),
        freqs: ffreqs.to_vec(),
    };
    Ok((admitted, filtered))
}

/// Restore-side shard routing.
pub fn belongs_to_partition(id: i64, partition_id: usize, partition_num: usize) -> bool {
    let num = partition_num.max(1) as i64;
    let part = ((id % num) + num) % num;
    part == partition_id as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_entries() -> ShardEntries {
        let mut e = ShardEntries::default();
        e.push(2001, &[2.0, 2.1], 20, 2);
        e.push(3, &[0.3, 0.31], 30, 3);
        e.push(1003, &[1.3, 1.31], 13, 1);
        e
    }

    #[test]
    fn bundle_tensor_names_are_sorted() {
        let bundle = build_shard("emb/table0", 2, 2, sample_entries(), ShardEntries::default());
        let names: Vec<&str> = bundle.tensors().iter().map(|t| t.name.as_str()).collect();
        let mut sorted = names.clone();
        sorted.sort_unstable();
        assert_eq!(names, sorted);
        assert_eq!(names.len(), 9);
        assert!(names.contains(&"emb/table0/part_2-partition_filter_offset"));
    }

    #[test]
    fn entries_group_by_sub_partition() {
        let bundle = build_shard("v", 0, 2, sample_entries(), ShardEntries::default());
        let keys = match &bundle.tensor("v/part_0-keys").unwrap().data {
            TensorData::I64(v) => v.clone(),
            _ => panic!(),
        };
        // Sub-partitions: 2001 → 1, 3 → 3, 1003 → 3. Bucket order, then id.
        assert_eq!(keys, vec![2001, 3, 1003]);

        let offsets = match &bundle.tensor("v/part_0-partition_offset").unwrap().data {
            TensorData::I32(v) => v.clone(),
            _ => panic!(),
        };
        assert_eq!(offsets.len(), SAVED_PARTITION_NUM + 1);
        assert_eq!(offsets[1], 0);
        assert_eq!(offsets[2], 1); // bucket 1 holds one key
        assert_eq!(offsets[3], 1);
        assert_eq!(offsets[4], 3); // bucket 3 holds two keys
        assert_eq!(offsets[SAVED_PARTITION_NUM], 3);
    }

    #[test]
    fn values_rows_follow_their_keys() {
        let bundle = build_shard("v", 0, 2, sample_entries(), ShardEntries::default());
        let (shape, values) = bundle.f32_tensor("v/part_0-values").unwrap();
        assert_eq!(shape, &[3, 2]);
        // Row 0 belongs to key 2001.
        assert_eq!(&values[0..2], &[2.0, 2.1]);
        assert_eq!(&values[2..4], &[0.3, 0.31]);
    }

    #[test]
    fn shard_round_trips() {
        let mut filtered = ShardEntries::default();
        filtered.push(77, &[], 5, 1);
        let bundle = build_shard("v", 1, 2, sample_entries(), filtered);
        let (admitted, filtered) = parse_shard(&bundle, "v", 1).unwrap();
        assert_eq!(admitted.len(), 3);
        assert_eq!(filtered.keys, vec![77]);
        assert_eq!(filtered.freqs, vec![1]);
        // Keys and their rows stay aligned through the round trip.
        let pos = admitted.keys.iter().position(|&k| k == 1003).unwrap();
        assert_eq!(&admitted.values[pos * 2..pos * 2 + 2], &[1.3, 1.31]);
        assert_eq!(admitted.versions[pos], 13);
    }

    #[test]
    fn negative_ids_route_deterministically() {
        assert!(belongs_to_partition(-7, (-7i64).rem_euclid(4) as usize, 4));
        let p = sub_partition(-1);
        assert!(p < SAVED_PARTITION_NUM);
        assert_eq!(p, sub_partition(-1));
    }

    #[test]
    fn missing_tensor_is_invalid_argument() {
        let bundle = build_shard("v", 0, 2, ShardEntries::default(), ShardEntries::default());
        assert!(matches!(
            parse_shard(&bundle, "w", 0),
            Err(Error::InvalidArgument(_))
        ));
    }
}
