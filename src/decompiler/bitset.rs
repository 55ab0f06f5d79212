/// 小さな整数集合のビットベクタ
///
/// レジスタ番号や定義番号の集合をコンパクトに保持する。
/// 空集合はアロケーションなしの定数 `BitSet::EMPTY` で表現する。

/// ビットベクタ（64要素/ワード）
#[derive(Debug, Clone, Default)]
pub struct BitSet {
    words: Vec<u64>,
}

/// レジスタ番号の集合
pub type RegSet = BitSet;

impl BitSet {
    /// 空集合（ヒープ確保なし・不変）
    pub const EMPTY: BitSet = BitSet { words: Vec::new() };

    pub fn new() -> Self {
        Self::EMPTY
    }

    /// 指定容量分のワードを確保した空集合
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            words: vec![0; capacity.div_ceil(64)],
        }
    }

    pub fn insert(&mut self, index: usize) -> bool {
        let word = index / 64;
        if word >= self.words.len() {
            self.words.resize(word + 1, 0);
        }
        let mask = 1u64 << (index % 64);
        let was_set = self.words[word] & mask != 0;
        self.words[word] |= mask;
        !was_set
    }

    pub fn remove(&mut self, index: usize) {
        let word = index / 64;
        if let Some(w) = self.words.get_mut(word) {
            *w &= !(1u64 << (index % 64));
        }
    }

    pub fn contains(&self, index: usize) -> bool {
        self.words
            .get(index / 64)
            .map(|w| w & (1u64 << (index % 64)) != 0)
            .unwrap_or(false)
    }

    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|&w| w == 0)
    }

    pub fn len(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// 共通要素があるか
    pub fn intersects(&self, other: &BitSet) -> bool {
        self.words
            .iter()
            .zip(other.words.iter())
            .any(|(a, b)| a & b != 0)
    }

    /// 和集合を取り、変化があればtrue
    pub fn union_with(&mut self, other: &BitSet) -> bool {
        if other.words.len() > self.words.len() {
            self.words.resize(other.words.len(), 0);
        }
        let mut changed = false;
        for (a, b) in self.words.iter_mut().zip(other.words.iter()) {
            let merged = *a | *b;
            if merged != *a {
                *a = merged;
                changed = true;
            }
        }
        changed
    }

    /// 差集合 self - other
    pub fn subtract(&mut self, other: &BitSet) {
        for (a, b) in self.words.iter_mut().zip(other.words.iter()) {
            *a &= !*b;
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.words.iter().enumerate().flat_map(|(wi, &word)| {
            (0..64usize).filter_map(move |bit| {
                if word & (1u64 << bit) != 0 {
                    Some(wi * 64 + bit)
                } else {
                    None
                }
            })
        })
    }
}

impl BitSet {
    /// 末尾のゼロワードを除いた実質的なワード列
    fn significant(&self) -> &[u64] {
        let len = self
            .words
            .iter()
            .rposition(|&w| w != 0)
            .map_or(0, |i| i + 1);
        &self.words[..len]
    }
}

impl PartialEq for BitSet {
    fn eq(&self, other: &Self) -> bool {
        self.significant() == other.significant()
    }
}

impl Eq for BitSet {}

impl std::hash::Hash for BitSet {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.significant().hash(state);
    }
}

impl FromIterator<usize> for BitSet {
    fn from_iter<I: IntoIterator<Item = usize>>(iter: I) -> Self {
        let mut set = BitSet::new();
        for i in iter {
            set.insert(i);
        }
        set
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_set_has_no_allocation() {
        let empty = BitSet::EMPTY;
        assert!(empty.is_empty());
        assert_eq!(empty.words.capacity(), 0);
        assert!(!empty.contains(0));
        assert!(!empty.intersects(&BitSet::from_iter([1, 2, 3])));
    }

    #[test]
    fn test_set_operations() {
        let mut a: BitSet = [1, 65, 130].into_iter().collect();
        let b: BitSet = [65, 7].into_iter().collect();

        assert!(a.intersects(&b));
        assert_eq!(a.len(), 3);

        assert!(a.union_with(&b));
        assert!(!a.union_with(&b));
        assert_eq!(a.iter().collect::<Vec<_>>(), vec![1, 7, 65, 130]);

        a.subtract(&b);
        assert_eq!(a.iter().collect::<Vec<_>>(), vec![1, 130]);

        a.remove(130);
        assert!(!a.contains(130));
        assert_eq!(a, BitSet::from_iter([1]));
    }
}
