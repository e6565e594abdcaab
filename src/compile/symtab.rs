use crate::compile::symbol::{ShadowBinding, Symbol, SymbolClass};
use crate::compile::types::DataType;
use crate::error::CompileError;
use std::collections::BTreeMap;

/// One EQUIVALENCE storage chain. Members are kept sorted by byte offset
/// from the representative, which is always `members[0]` at offset zero.
#[derive(Debug, Default)]
pub struct EquivChain {
    pub members: Vec<(String, i64)>,
}

impl EquivChain {
    pub fn offset_of(&self, name: &str) -> Option<i64> {
        self.members
            .iter()
            .find(|(n, _)| n == name)
            .map(|&(_, off)| off)
    }

    fn normalize(&mut self) {
        let min = self.members.iter().map(|&(_, o)| o).min().unwrap_or(0);
        for m in &mut self.members {
            m.1 -= min;
        }
        self.members.sort_by(|a, b| a.1.cmp(&b.1).then(a.0.cmp(&b.0)));
    }
}

/// Symbols of the current program unit, keyed by (qualifier, identifier).
/// An unqualified lookup tries the current qualifier and then the default
/// (empty) qualifier. A separate insertion-order chain gives the layout
/// passes a deterministic traversal. Statement-function formals live under
/// the function's name as qualifier.
pub struct SymbolTable {
    map: BTreeMap<(String, String), Symbol>,
    order: Vec<(String, String)>,
    qualifier: String,
    chains: Vec<EquivChain>,
}

impl SymbolTable {
    pub fn new() -> SymbolTable {
        SymbolTable {
            map: BTreeMap::new(),
            order: Vec::new(),
            qualifier: String::new(),
            chains: Vec::new(),
        }
    }

    /// Destroys every symbol and chain; runs at the END of a program unit.
    pub fn clear(&mut self) {
        self.map.clear();
        self.order.clear();
        self.qualifier.clear();
        self.chains.clear();
    }

    pub fn set_qualifier(&mut self, q: &str) {
        self.qualifier = q.to_string();
    }

    pub fn qualifier(&self) -> &str {
        &self.qualifier
    }

    /// Registers a symbol under the default qualifier. Returns `None` when
    /// the identifier is already present and live; a tombstoned node is
    /// revived with the new class and type.
    pub fn register(
        &mut self,
        name: &str,
        class: SymbolClass,
        dtype: DataType,
    ) -> Option<&mut Symbol> {
        self.register_qualified("", name, class, dtype)
    }

    pub fn register_qualified(
        &mut self,
        qualifier: &str,
        name: &str,
        class: SymbolClass,
        dtype: DataType,
    ) -> Option<&mut Symbol> {
        let key = (qualifier.to_string(), name.to_string());
        if let Some(existing) = self.map.get_mut(&key) {
            if !existing.is_deleted {
                return None;
            }
            *existing = Symbol::new(name, class, dtype);
            return self.map.get_mut(&key);
        }
        self.order.push(key.clone());
        self.map.insert(key.clone(), Symbol::new(name, class, dtype));
        self.map.get_mut(&key)
    }

    fn resolve_key(&self, name: &str) -> Option<(String, String)> {
        if !self.qualifier.is_empty() {
            let key = (self.qualifier.clone(), name.to_string());
            if self.map.get(&key).map_or(false, |s| !s.is_deleted) {
                return Some(key);
            }
        }
        let key = (String::new(), name.to_string());
        if self.map.get(&key).map_or(false, |s| !s.is_deleted) {
            return Some(key);
        }
        None
    }

    pub fn find(&self, name: &str) -> Option<&Symbol> {
        let key = self.resolve_key(name)?;
        self.map.get(&key)
    }

    pub fn find_mut(&mut self, name: &str) -> Option<&mut Symbol> {
        let key = self.resolve_key(name)?;
        self.map.get_mut(&key)
    }

    /// Marks a symbol deleted without disturbing the insertion order.
    pub fn delete(&mut self, name: &str) {
        if let Some(key) = self.resolve_key(name) {
            if let Some(s) = self.map.get_mut(&key) {
                s.is_deleted = true;
            }
        }
    }

    /// Installs a shadow binding; `find` keeps returning the symbol but
    /// the evaluator reads the shadow first until `remove_shadow`.
    pub fn shadow(&mut self, name: &str, binding: ShadowBinding) -> Result<(), CompileError> {
        match self.find_mut(name) {
            Some(s) => {
                s.shadow = Some(binding);
                Ok(())
            }
            None => Err(CompileError::InvalidReference(name.to_string())),
        }
    }

    pub fn remove_shadow(&mut self, name: &str) -> Option<ShadowBinding> {
        self.find_mut(name).and_then(|s| s.shadow.take())
    }

    /// Insertion-order traversal over live symbols of the default
    /// qualifier; the layout passes depend on this order.
    pub fn iter_in_order(&self) -> impl Iterator<Item = &Symbol> + '_ {
        self.order
            .iter()
            .filter(|(q, _)| q.is_empty())
            .filter_map(move |key| self.map.get(key))
            .filter(|s| !s.is_deleted)
    }

    pub fn names_in_order(&self) -> Vec<String> {
        self.iter_in_order().map(|s| s.name.clone()).collect()
    }

    // --- EQUIVALENCE chains ---

    pub fn chain(&self, index: usize) -> &EquivChain {
        &self.chains[index]
    }

    pub fn chains(&self) -> &[EquivChain] {
        &self.chains
    }

    /// Records that `a`'s byte `a_off` and `b`'s byte `b_off` are the same
    /// storage location, creating or merging chains as required.
    pub fn link_equivalence(
        &mut self,
        a: &str,
        a_off: i64,
        b: &str,
        b_off: i64,
    ) -> Result<(), CompileError> {
        let ia = self.find(a).and_then(|s| s.equiv);
        let ib = self.find(b).and_then(|s| s.equiv);

        match (ia, ib) {
            (None, None) => {
                let mut chain = EquivChain::default();
                chain.members.push((a.to_string(), 0));
                chain.members.push((b.to_string(), a_off - b_off));
                chain.normalize();
                let idx = self.chains.len();
                self.chains.push(chain);
                self.set_chain_index(a, idx);
                self.set_chain_index(b, idx);
            }
            (Some(i), None) => {
                let pos_a = self.chains[i].offset_of(a).unwrap();
                self.chains[i]
                    .members
                    .push((b.to_string(), pos_a + a_off - b_off));
                self.chains[i].normalize();
                self.rebind_chain(i);
                self.set_chain_index(b, i);
            }
            (None, Some(j)) => {
                let pos_b = self.chains[j].offset_of(b).unwrap();
                self.chains[j]
                    .members
                    .push((a.to_string(), pos_b + b_off - a_off));
                self.chains[j].normalize();
                self.rebind_chain(j);
                self.set_chain_index(a, j);
            }
            (Some(i), Some(j)) if i == j => {
                let pos_a = self.chains[i].offset_of(a).unwrap();
                let pos_b = self.chains[i].offset_of(b).unwrap();
                if pos_a + a_off != pos_b + b_off {
                    return Err(CompileError::InvalidEquivalence(
                        "conflicting offsets within one chain",
                    ));
                }
            }
            (Some(i), Some(j)) => {
                // merge chain j into chain i at the alignment the new pair
                // dictates
                let pos_a = self.chains[i].offset_of(a).unwrap();
                let pos_b = self.chains[j].offset_of(b).unwrap();
                let shift = pos_a + a_off - b_off - pos_b;
                let moved = std::mem::take(&mut self.chains[j].members);
                for (name, off) in moved {
                    if let Some(existing) = self.chains[i].offset_of(&name) {
                        if existing != off + shift {
                            return Err(CompileError::InvalidEquivalence(
                                "conflicting offsets between chains",
                            ));
                        }
                        continue;
                    }
                    self.chains[i].members.push((name, off + shift));
                }
                self.chains[i].normalize();
                self.rebind_chain(i);
            }
        }
        Ok(())
    }

    fn set_chain_index(&mut self, name: &str, idx: usize) {
        if let Some(s) = self.find_mut(name) {
            s.equiv = Some(idx);
        }
    }

    fn rebind_chain(&mut self, idx: usize) {
        let names: Vec<String> = self.chains[idx]
            .members
            .iter()
            .map(|(n, _)| n.clone())
            .collect();
        for n in names {
            self.set_chain_index(&n, idx);
        }
    }
}

/// A named COMMON block. The cursor restarts for every program unit that
/// declares the block; `limit` is the high-water mark across all units.
#[derive(Debug)]
pub struct CommonBlock {
    pub label: String,
    pub cursor: u64,
    pub limit: u64,
}

/// COMMON blocks outlive program units, so this table is owned by the
/// whole compilation and only the cursors reset per unit.
#[derive(Default)]
pub struct CommonTable {
    map: BTreeMap<String, CommonBlock>,
}

impl CommonTable {
    pub fn new() -> CommonTable {
        CommonTable::default()
    }

    pub fn declare(&mut self, name: &str, label: String) -> &mut CommonBlock {
        self.map.entry(name.to_string()).or_insert(CommonBlock {
            label,
            cursor: 0,
            limit: 0,
        })
    }

    pub fn get(&self, name: &str) -> Option<&CommonBlock> {
        self.map.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut CommonBlock> {
        self.map.get_mut(name)
    }

    pub fn reset_cursors(&mut self) {
        for b in self.map.values_mut() {
            b.cursor = 0;
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &CommonBlock)> + '_ {
        self.map.iter()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::compile::types::{BaseType, DataType};

    fn table_with(names: &[&str]) -> SymbolTable {
        let mut t = SymbolTable::new();
        for n in names {
            t.register(n, SymbolClass::Auto, DataType::scalar(BaseType::Real));
        }
        t
    }

    #[test]
    fn duplicate_registration_returns_none() {
        let mut t = table_with(&["A"]);
        assert!(t
            .register("A", SymbolClass::Auto, DataType::scalar(BaseType::Real))
            .is_none());
    }

    #[test]
    fn deleted_symbol_is_revived() {
        let mut t = table_with(&["A"]);
        t.delete("A");
        assert!(t.find("A").is_none());
        let s = t
            .register("A", SymbolClass::Static, DataType::scalar(BaseType::Integer))
            .unwrap();
        assert_eq!(s.class, SymbolClass::Static);
    }

    #[test]
    fn qualifier_falls_back_to_default() {
        let mut t = SymbolTable::new();
        t.register("X", SymbolClass::Auto, DataType::scalar(BaseType::Real));
        t.register_qualified("F", "X", SymbolClass::Argument, DataType::scalar(BaseType::Real));
        t.set_qualifier("F");
        assert_eq!(t.find("X").unwrap().class, SymbolClass::Argument);
        t.set_qualifier("");
        assert_eq!(t.find("X").unwrap().class, SymbolClass::Auto);
    }

    #[test]
    fn insertion_order_is_preserved() {
        let t = table_with(&["C", "A", "B"]);
        assert_eq!(t.names_in_order(), vec!["C", "A", "B"]);
    }

    #[test]
    fn equivalence_chain_roots_at_lowest_offset() {
        let mut t = table_with(&["A", "B"]);
        // B's byte 16 coincides with A's byte 0: B starts 16 bytes below A
        t.link_equivalence("A", 0, "B", 16).unwrap();
        let idx = t.find("A").unwrap().equiv.unwrap();
        let chain = t.chain(idx);
        assert_eq!(chain.members[0], ("B".to_string(), 0));
        assert_eq!(chain.offset_of("A"), Some(16));
    }

    #[test]
    fn chains_merge_through_a_shared_member() {
        let mut t = table_with(&["A", "B", "C", "D"]);
        t.link_equivalence("A", 0, "B", 0).unwrap();
        t.link_equivalence("C", 0, "D", 0).unwrap();
        t.link_equivalence("B", 8, "C", 0).unwrap();
        let idx = t.find("A").unwrap().equiv.unwrap();
        let chain = t.chain(idx);
        assert_eq!(chain.members.len(), 4);
        assert_eq!(chain.offset_of("C"), Some(8));
        assert_eq!(chain.offset_of("D"), Some(8));
    }

    #[test]
    fn conflicting_equivalence_is_rejected() {
        let mut t = table_with(&["A", "B"]);
        t.link_equivalence("A", 0, "B", 0).unwrap();
        assert!(t.link_equivalence("A", 8, "B", 0).is_err());
    }

    #[test]
    fn common_limit_is_a_high_water_mark() {
        let mut commons = CommonTable::new();
        {
            let b = commons.declare("B", "@B".to_string());
            b.cursor = 101;
            b.limit = b.limit.max(b.cursor);
        }
        commons.reset_cursors();
        {
            let b = commons.declare("B", "@B".to_string());
            b.cursor = 50;
            b.limit = b.limit.max(b.cursor);
        }
        assert_eq!(commons.get("B").unwrap().limit, 101);
    }
}
