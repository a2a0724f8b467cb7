//! Signal store and strided views.
//!
//! All simulation state lives in base signals owned by the chunk's
//! [`SignalStore`]. Operators never own data; they hold [`ResolvedView`]s,
//! strided windows into a base signal resolved to an arena slot when the
//! operator is added. Once the build completes no base is ever added or
//! removed, so slot indices and backing storage stay stable for the run.

use std::fmt;
use std::str::FromStr;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::error::{BuildError, BuildResult};
use crate::tensor::Tensor;
use crate::types::Key;

/// Descriptor of a strided window into a base signal.
///
/// The wire form is `key:ndim:shape1,shape2:stride1,stride2:offset[:label]`,
/// or a bare `key` for a full-extent view of the base.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalSpec {
    pub base_key: Key,
    pub label: String,
    pub ndim: u8,
    pub shape1: usize,
    pub shape2: usize,
    pub stride1: isize,
    pub stride2: isize,
    pub offset: usize,
}

impl SignalSpec {
    /// Spec for a full-extent view; shape is taken from the base at resolve
    /// time.
    pub fn full(base_key: Key) -> Self {
        Self {
            base_key,
            label: String::new(),
            ndim: 0,
            shape1: 0,
            shape2: 0,
            stride1: 0,
            stride2: 0,
            offset: 0,
        }
    }

    fn is_full(&self) -> bool {
        self.ndim == 0
    }
}

impl fmt::Display for SignalSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_full() {
            write!(f, "{}", self.base_key)
        } else {
            write!(
                f,
                "{}:{}:{},{}:{},{}:{}:{}",
                self.base_key,
                self.ndim,
                self.shape1,
                self.shape2,
                self.stride1,
                self.stride2,
                self.offset,
                self.label
            )
        }
    }
}

impl FromStr for SignalSpec {
    type Err = BuildError;

    fn from_str(s: &str) -> BuildResult<Self> {
        let bad = |s: &str| BuildError::BadSpec(format!("signal spec '{s}'"));

        let fields: Vec<&str> = s.split(':').collect();
        match fields.as_slice() {
            [key] => {
                let key: u64 = key.trim().parse().map_err(|_| bad(s))?;
                Ok(SignalSpec::full(Key(key)))
            }
            [key, ndim, shape, stride, offset, rest @ ..] => {
                let key: u64 = key.trim().parse().map_err(|_| bad(s))?;
                let ndim: u8 = ndim.trim().parse().map_err(|_| bad(s))?;
                if ndim == 0 || ndim > 2 {
                    return Err(bad(s));
                }
                let (shape1, shape2) = parse_pair(shape).ok_or_else(|| bad(s))?;
                let (stride1, stride2) = parse_pair(stride).ok_or_else(|| bad(s))?;
                let offset: usize = offset.trim().parse().map_err(|_| bad(s))?;
                let label = rest.join(":");
                Ok(SignalSpec {
                    base_key: Key(key),
                    label,
                    ndim,
                    shape1,
                    shape2,
                    stride1,
                    stride2,
                    offset,
                })
            }
            _ => Err(bad(s)),
        }
    }
}

fn parse_pair<T: FromStr>(s: &str) -> Option<(T, T)> {
    let (a, b) = s.split_once(',')?;
    Some((a.trim().parse().ok()?, b.trim().parse().ok()?))
}

/// A view resolved against the store: arena slot plus strided geometry.
///
/// Element `(i, j)` of the view maps to flat index
/// `offset + i * stride1 + j * stride2` of the base, iterated row-major.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResolvedView {
    pub(crate) slot: usize,
    pub shape1: usize,
    pub shape2: usize,
    pub stride1: isize,
    pub stride2: isize,
    pub offset: usize,
}

impl ResolvedView {
    /// Number of elements the view exposes.
    pub fn len(&self) -> usize {
        self.shape1 * self.shape2
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Shape as (rows, cols).
    pub fn shape(&self) -> (usize, usize) {
        (self.shape1, self.shape2)
    }

    fn flat_index(&self, i: usize, j: usize) -> usize {
        (self.offset as isize + i as isize * self.stride1 + j as isize * self.stride2) as usize
    }
}

/// A named base signal plus the snapshot used by reset.
#[derive(Debug)]
struct BaseSignal {
    key: Key,
    label: String,
    tensor: Tensor,
    initial: Tensor,
}

/// Arena of base signals, keyed for build-time lookup and slot-indexed for
/// the step loop.
#[derive(Debug, Default)]
pub struct SignalStore {
    bases: Vec<BaseSignal>,
    index: IndexMap<Key, usize>,
}

impl SignalStore {
    /// Add a base signal. The key must not already be present.
    pub fn add_base(&mut self, key: Key, label: String, tensor: Tensor) -> BuildResult<()> {
        if self.index.contains_key(&key) {
            return Err(BuildError::DuplicateKey(key));
        }
        let slot = self.bases.len();
        let initial = tensor.clone();
        self.bases.push(BaseSignal {
            key,
            label,
            tensor,
            initial,
        });
        self.index.insert(key, slot);
        Ok(())
    }

    /// Number of base signals.
    pub fn len(&self) -> usize {
        self.bases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bases.is_empty()
    }

    pub fn contains(&self, key: Key) -> bool {
        self.index.contains_key(&key)
    }

    /// Shape of a base signal.
    pub fn shape_of(&self, key: Key) -> BuildResult<(usize, usize)> {
        let slot = self.slot_of(key)?;
        Ok(self.bases[slot].tensor.shape())
    }

    /// Diagnostic label of a base signal.
    pub fn label_of(&self, key: Key) -> BuildResult<&str> {
        let slot = self.slot_of(key)?;
        Ok(&self.bases[slot].label)
    }

    /// Direct read access to a base, for tests and diagnostics.
    pub fn tensor(&self, key: Key) -> BuildResult<&Tensor> {
        let slot = self.slot_of(key)?;
        Ok(&self.bases[slot].tensor)
    }

    fn slot_of(&self, key: Key) -> BuildResult<usize> {
        self.index
            .get(&key)
            .copied()
            .ok_or(BuildError::UnknownKey(key))
    }

    /// Resolve a spec to a view, validating that every element it names is
    /// in bounds of the base.
    pub fn resolve(&self, spec: &SignalSpec) -> BuildResult<ResolvedView> {
        let slot = self.slot_of(spec.base_key)?;
        let base_len = self.bases[slot].tensor.len();

        let view = if spec.is_full() {
            let (rows, cols) = self.bases[slot].tensor.shape();
            ResolvedView {
                slot,
                shape1: rows,
                shape2: cols,
                stride1: cols as isize,
                stride2: 1,
                offset: 0,
            }
        } else {
            let (shape2, stride2) = if spec.ndim == 1 {
                (1, 0)
            } else {
                (spec.shape2, spec.stride2)
            };
            ResolvedView {
                slot,
                shape1: spec.shape1,
                shape2,
                stride1: spec.stride1,
                stride2,
                offset: spec.offset,
            }
        };

        if !view_in_bounds(&view, base_len) {
            return Err(BuildError::ViewOutOfBounds {
                key: spec.base_key,
                label: if spec.label.is_empty() {
                    spec.to_string()
                } else {
                    spec.label.clone()
                },
            });
        }
        Ok(view)
    }

    /// Full-extent view of a base signal.
    pub fn full_view(&self, key: Key) -> BuildResult<ResolvedView> {
        self.resolve(&SignalSpec::full(key))
    }

    /// Copy the view's elements into `out`, row-major. `out.len()` must equal
    /// the view length.
    pub fn gather_into(&self, view: &ResolvedView, out: &mut [f64]) {
        debug_assert_eq!(out.len(), view.len());
        let data = self.bases[view.slot].tensor.data();
        let mut n = 0;
        for i in 0..view.shape1 {
            for j in 0..view.shape2 {
                out[n] = data[view.flat_index(i, j)];
                n += 1;
            }
        }
    }

    /// Copy the view's elements into a fresh Vec, row-major.
    pub fn gather_vec(&self, view: &ResolvedView) -> Vec<f64> {
        let mut out = vec![0.0; view.len()];
        self.gather_into(view, &mut out);
        out
    }

    /// Write `src` into the view's elements, row-major.
    pub fn scatter(&mut self, view: &ResolvedView, src: &[f64]) {
        debug_assert_eq!(src.len(), view.len());
        let data = self.bases[view.slot].tensor.data_mut();
        let mut n = 0;
        for i in 0..view.shape1 {
            for j in 0..view.shape2 {
                data[view.flat_index(i, j)] = src[n];
                n += 1;
            }
        }
    }

    /// Set every element of the view to `value`.
    pub fn fill(&mut self, view: &ResolvedView, value: f64) {
        let data = self.bases[view.slot].tensor.data_mut();
        for i in 0..view.shape1 {
            for j in 0..view.shape2 {
                data[view.flat_index(i, j)] = value;
            }
        }
    }

    /// Add `src` element-wise into the view.
    pub fn add_assign(&mut self, view: &ResolvedView, src: &[f64]) {
        debug_assert_eq!(src.len(), view.len());
        let data = self.bases[view.slot].tensor.data_mut();
        let mut n = 0;
        for i in 0..view.shape1 {
            for j in 0..view.shape2 {
                data[view.flat_index(i, j)] += src[n];
                n += 1;
            }
        }
    }

    /// Snapshot a view into a tensor of the view's shape.
    pub fn snapshot(&self, view: &ResolvedView) -> Tensor {
        Tensor::from_vec(view.shape1, view.shape2, self.gather_vec(view))
    }

    /// Restore every base signal to its initial value.
    pub fn restore_initial(&mut self) {
        for base in &mut self.bases {
            base.tensor = base.initial.clone();
        }
    }

    /// Keys in insertion order.
    pub fn keys(&self) -> impl Iterator<Item = Key> + '_ {
        self.bases.iter().map(|b| b.key)
    }
}

/// Every addressable element of the view must land inside the base.
fn view_in_bounds(view: &ResolvedView, base_len: usize) -> bool {
    if view.len() == 0 {
        return view.offset <= base_len;
    }
    let span1 = view.stride1 * (view.shape1 as isize - 1);
    let span2 = view.stride2 * (view.shape2 as isize - 1);
    let lo = view.offset as isize + span1.min(0) + span2.min(0);
    let hi = view.offset as isize + span1.max(0) + span2.max(0);
    lo >= 0 && (hi as usize) < base_len
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with(key: u64, tensor: Tensor) -> SignalStore {
        let mut store = SignalStore::default();
        store.add_base(Key(key), format!("sig{key}"), tensor).unwrap();
        store
    }

    #[test]
    fn test_duplicate_key_rejected() {
        let mut store = store_with(1, Tensor::vector(&[0.0]));
        let err = store.add_base(Key(1), "dup".into(), Tensor::vector(&[0.0]));
        assert!(matches!(err, Err(BuildError::DuplicateKey(Key(1)))));
    }

    #[test]
    fn test_full_view_round_trip() {
        let mut store = store_with(7, Tensor::from_slice(2, 2, &[1.0, 2.0, 3.0, 4.0]));
        let view = store.full_view(Key(7)).unwrap();
        assert_eq!(store.gather_vec(&view), vec![1.0, 2.0, 3.0, 4.0]);

        store.scatter(&view, &[5.0, 6.0, 7.0, 8.0]);
        assert_eq!(store.tensor(Key(7)).unwrap().get(1, 1), 8.0);
    }

    #[test]
    fn test_strided_column_view() {
        // Column 1 of a 3x2 base.
        let store = store_with(
            3,
            Tensor::from_slice(3, 2, &[0.0, 1.0, 2.0, 3.0, 4.0, 5.0]),
        );
        let spec: SignalSpec = "3:1:3,1:2,0:1".parse().unwrap();
        let view = store.resolve(&spec).unwrap();
        assert_eq!(store.gather_vec(&view), vec![1.0, 3.0, 5.0]);
    }

    #[test]
    fn test_view_out_of_bounds() {
        let store = store_with(2, Tensor::vector(&[0.0, 0.0, 0.0]));
        let spec: SignalSpec = "2:1:4,1:1,0:0".parse().unwrap();
        assert!(matches!(
            store.resolve(&spec),
            Err(BuildError::ViewOutOfBounds { key: Key(2), .. })
        ));
    }

    #[test]
    fn test_negative_stride_view() {
        let store = store_with(9, Tensor::vector(&[1.0, 2.0, 3.0]));
        let spec: SignalSpec = "9:1:3,1:-1,0:2:rev".parse().unwrap();
        let view = store.resolve(&spec).unwrap();
        assert_eq!(store.gather_vec(&view), vec![3.0, 2.0, 1.0]);
    }

    #[test]
    fn test_spec_string_forms() {
        let full: SignalSpec = "42".parse().unwrap();
        assert_eq!(full, SignalSpec::full(Key(42)));

        let spec: SignalSpec = "5:2:2,3:3,1:0:my view".parse().unwrap();
        assert_eq!(spec.base_key, Key(5));
        assert_eq!((spec.shape1, spec.shape2), (2, 3));
        assert_eq!((spec.stride1, spec.stride2), (3, 1));
        assert_eq!(spec.label, "my view");
        assert_eq!(spec.to_string().parse::<SignalSpec>().unwrap(), spec);

        assert!("not-a-key".parse::<SignalSpec>().is_err());
        assert!("5:3:1,1:1,1:0".parse::<SignalSpec>().is_err());
    }

    #[test]
    fn test_restore_initial() {
        let mut store = store_with(1, Tensor::vector(&[9.0]));
        let view = store.full_view(Key(1)).unwrap();
        store.fill(&view, 5.0);
        assert_eq!(store.gather_vec(&view), vec![5.0]);
        store.restore_initial();
        assert_eq!(store.gather_vec(&view), vec![9.0]);
    }

    #[test]
    fn test_unknown_key() {
        let store = SignalStore::default();
        assert!(matches!(
            store.full_view(Key(1)),
            Err(BuildError::UnknownKey(Key(1)))
        ));
    }
}
