//! Preallocated per-slot KV cache.
//!
//! The [`SequenceCache`] owns one [`CacheRegion`] per batch slot. Every region
//! holds, for each transformer layer, a key and a value tensor sized for the
//! worst-case sequence length of the session.
//!
//! ## Memory Layout
//!
//! Per slot and per layer:
//! `[max_seq_len, num_kv_heads, head_dim]` for keys and the same for values.
//!
//! Storage is allocated once in [`SequenceCache::allocate`]. Writes go into the
//! existing buffers with `slice_set`, so a session never reallocates. A region's
//! `len` marks how many leading positions hold valid history; anything after it
//! is stale and must be masked by the model.

use candle_core::{DType, Device, Tensor};

use crate::error::{Error, Result};

/// Shape parameters of the cache, supplied by the model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheConfig {
    /// Number of transformer layers.
    pub num_layers: usize,
    /// Number of KV heads (for GQA, typically fewer than Q heads).
    pub num_kv_heads: usize,
    /// Dimension per head.
    pub head_dim: usize,
    /// Data type for cache tensors.
    pub dtype: DType,
}

impl CacheConfig {
    /// Create a new cache configuration with F32 storage.
    pub fn new(num_layers: usize, num_kv_heads: usize, head_dim: usize) -> Self {
        Self {
            num_layers,
            num_kv_heads,
            head_dim,
            dtype: DType::F32,
        }
    }

    /// Set the data type.
    pub fn with_dtype(mut self, dtype: DType) -> Self {
        self.dtype = dtype;
        self
    }

    /// Bytes held by one slot (all layers, K and V) at the given capacity.
    ///
    /// `None` when the size does not fit in `usize`.
    pub fn region_size_bytes(&self, max_seq_len: usize) -> Option<usize> {
        max_seq_len
            .checked_mul(self.num_kv_heads)?
            .checked_mul(self.head_dim)?
            .checked_mul(self.dtype.size_in_bytes())?
            .checked_mul(self.num_layers)?
            .checked_mul(2)
    }

    /// Bytes held by the whole cache, `None` on overflow.
    pub fn total_size_bytes(&self, batch_size: usize, max_seq_len: usize) -> Option<usize> {
        self.region_size_bytes(max_seq_len)?.checked_mul(batch_size)
    }
}

/// Key/value history of one slot.
#[derive(Debug)]
pub struct CacheRegion {
    /// Key buffers, one per layer.
    keys: Vec<Tensor>,
    /// Value buffers, one per layer.
    values: Vec<Tensor>,
    /// Number of valid positions.
    len: usize,
}

impl CacheRegion {
    fn allocate(config: &CacheConfig, max_seq_len: usize, device: &Device) -> Result<Self> {
        let shape = (max_seq_len, config.num_kv_heads, config.head_dim);
        let mut keys = Vec::with_capacity(config.num_layers);
        let mut values = Vec::with_capacity(config.num_layers);
        for _ in 0..config.num_layers {
            keys.push(Tensor::zeros(shape, config.dtype, device)?);
            values.push(Tensor::zeros(shape, config.dtype, device)?);
        }
        Ok(Self {
            keys,
            values,
            len: 0,
        })
    }

    /// Number of valid positions.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the region holds no history.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// KV cache for a fixed number of batch slots.
#[derive(Debug)]
pub struct SequenceCache {
    /// One region per slot.
    regions: Vec<CacheRegion>,
    /// Shape parameters.
    config: CacheConfig,
    /// Positions per region.
    max_seq_len: usize,
    /// Device holding the buffers.
    device: Device,
    /// Total bytes of the buffers.
    bytes: usize,
}

impl SequenceCache {
    /// Reserves storage for `batch_size` slots of `max_seq_len` positions each.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ResourceExhausted`] when the total size exceeds
    /// `memory_limit`, before anything is allocated. A size that overflows
    /// `usize` is reported as `requested: usize::MAX`, or as
    /// [`Error::Config`] when there is no limit.
    pub fn allocate(
        config: CacheConfig,
        device: &Device,
        batch_size: usize,
        max_seq_len: usize,
        memory_limit: Option<usize>,
    ) -> Result<Self> {
        if batch_size == 0 || max_seq_len == 0 {
            return Err(Error::Config(format!(
                "cannot allocate a cache of {batch_size} slots x {max_seq_len} positions"
            )));
        }
        let requested = match (config.total_size_bytes(batch_size, max_seq_len), memory_limit) {
            (Some(requested), Some(limit)) if requested > limit => {
                return Err(Error::ResourceExhausted { requested, limit });
            }
            (Some(requested), _) => requested,
            (None, Some(limit)) => {
                return Err(Error::ResourceExhausted {
                    requested: usize::MAX,
                    limit,
                });
            }
            (None, None) => {
                return Err(Error::Config(format!(
                    "cache of {batch_size} slots x {max_seq_len} positions overflows usize"
                )));
            }
        };

        let regions = (0..batch_size)
            .map(|_| CacheRegion::allocate(&config, max_seq_len, device))
            .collect::<Result<Vec<_>>>()?;

        tracing::info!(
            batch_size,
            max_seq_len,
            num_layers = config.num_layers,
            bytes = requested,
            "allocated KV cache"
        );

        Ok(Self {
            regions,
            config,
            max_seq_len,
            device: device.clone(),
            bytes: requested,
        })
    }

    /// Get the configuration.
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Get the device.
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Number of slots.
    pub fn batch_size(&self) -> usize {
        self.regions.len()
    }

    /// Positions available per slot.
    pub fn capacity(&self) -> usize {
        self.max_seq_len
    }

    /// Total bytes held by the cache buffers.
    pub fn memory_bytes(&self) -> usize {
        self.bytes
    }

    /// Get a slot's region.
    pub fn region(&self, slot: usize) -> Result<&CacheRegion> {
        let batch_size = self.batch_size();
        self.regions
            .get(slot)
            .ok_or(Error::SlotOutOfRange { slot, batch_size })
    }

    fn region_mut(&mut self, slot: usize) -> Result<&mut CacheRegion> {
        let batch_size = self.batch_size();
        self.regions
            .get_mut(slot)
            .ok_or(Error::SlotOutOfRange { slot, batch_size })
    }

    /// Number of valid positions in a slot.
    pub fn len(&self, slot: usize) -> Result<usize> {
        Ok(self.region(slot)?.len)
    }

    /// Writes keys and values for `n` consecutive positions starting at `position`.
    ///
    /// `keys` and `values` have shape `[n, num_kv_heads, head_dim]`. The region's
    /// length is not changed; call [`advance`](Self::advance) once every layer
    /// has been written.
    pub fn write(
        &mut self,
        slot: usize,
        layer: usize,
        position: usize,
        keys: &Tensor,
        values: &Tensor,
    ) -> Result<()> {
        let capacity = self.max_seq_len;
        let dtype = self.config.dtype;
        let num_layers = self.config.num_layers;
        if layer >= num_layers {
            return Err(Error::Config(format!(
                "layer {layer} out of bounds (cache has {num_layers})"
            )));
        }
        let n = keys.dim(0)?;
        if position + n > capacity {
            return Err(Error::CacheOverflow {
                slot,
                position: position + n,
                capacity,
            });
        }
        let region = self.region_mut(slot)?;
        let keys = keys.to_dtype(dtype)?.contiguous()?;
        let values = values.to_dtype(dtype)?.contiguous()?;
        region.keys[layer].slice_set(&keys, 0, position)?;
        region.values[layer].slice_set(&values, 0, position)?;
        Ok(())
    }

    /// Marks `n` more positions of a slot as valid.
    pub fn advance(&mut self, slot: usize, n: usize) -> Result<()> {
        let capacity = self.max_seq_len;
        let region = self.region_mut(slot)?;
        let new_len = region.len + n;
        if new_len > capacity {
            return Err(Error::CacheOverflow {
                slot,
                position: new_len,
                capacity,
            });
        }
        region.len = new_len;
        Ok(())
    }

    /// Drops history past `len`. Truncating to a longer length is a no-op.
    pub fn truncate(&mut self, slot: usize, len: usize) -> Result<()> {
        let region = self.region_mut(slot)?;
        region.len = region.len.min(len);
        Ok(())
    }

    /// Clears one slot without touching the others.
    pub fn reset(&mut self, slot: usize) -> Result<()> {
        self.region_mut(slot)?.len = 0;
        Ok(())
    }

    /// Clears every slot.
    pub fn reset_all(&mut self) {
        for region in &mut self.regions {
            region.len = 0;
        }
    }

    /// Reads the first `len` positions of a slot's layer.
    ///
    /// # Returns
    ///
    /// `(keys, values)`, each `[len, num_kv_heads, head_dim]`.
    pub fn read(&self, slot: usize, layer: usize, len: usize) -> Result<(Tensor, Tensor)> {
        self.check_span(layer, len)?;
        let region = self.region(slot)?;
        Ok((
            region.keys[layer].narrow(0, 0, len)?,
            region.values[layer].narrow(0, 0, len)?,
        ))
    }

    /// Stacks the first `kv_len` positions of slots `0..num_slots` for one layer.
    ///
    /// # Returns
    ///
    /// `(keys, values)`, each `[num_slots, kv_len, num_kv_heads, head_dim]`.
    pub fn gather(&self, layer: usize, num_slots: usize, kv_len: usize) -> Result<(Tensor, Tensor)> {
        self.check_span(layer, kv_len)?;
        if num_slots == 0 || num_slots > self.batch_size() {
            return Err(Error::SlotOutOfRange {
                slot: num_slots.saturating_sub(1),
                batch_size: self.batch_size(),
            });
        }
        let regions = &self.regions[..num_slots];
        let keys = regions
            .iter()
            .map(|r| r.keys[layer].narrow(0, 0, kv_len))
            .collect::<candle_core::Result<Vec<_>>>()?;
        let values = regions
            .iter()
            .map(|r| r.values[layer].narrow(0, 0, kv_len))
            .collect::<candle_core::Result<Vec<_>>>()?;
        Ok((Tensor::stack(&keys, 0)?, Tensor::stack(&values, 0)?))
    }

    fn check_span(&self, layer: usize, len: usize) -> Result<()> {
        if layer >= self.config.num_layers {
            return Err(Error::Config(format!(
                "layer {layer} out of bounds (cache has {})",
                self.config.num_layers
            )));
        }
        if len > self.max_seq_len {
            return Err(Error::CacheOverflow {
                slot: 0,
                position: len,
                capacity: self.max_seq_len,
            });
        }
        Ok(())
    }
}
