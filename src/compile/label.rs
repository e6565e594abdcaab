use crate::error::CompileError;
use std::collections::BTreeMap;

/// A statement label as it appears in columns 1-5 of the source, mapped to
/// the CAL-local label generated for it.
#[derive(Debug)]
pub struct UserLabel {
    pub cal: String,
    pub defined: bool,
    pub forward_ref: bool,
}

/// Generates CAL-local labels and tracks the user statement labels of the
/// current program unit. A reference to a not-yet-defined label leaves a
/// placeholder with `forward_ref` set; the defining statement clears it.
/// Labels do not survive the END of a unit.
pub struct LabelManager {
    next: u32,
    user: BTreeMap<u32, UserLabel>,
}

impl LabelManager {
    pub fn new() -> LabelManager {
        LabelManager {
            next: 1,
            user: BTreeMap::new(),
        }
    }

    pub fn reset(&mut self) {
        self.next = 1;
        self.user.clear();
    }

    /// A fresh CAL-local label.
    pub fn generate(&mut self) -> String {
        let l = format!("L{:05}", self.next);
        self.next += 1;
        l
    }

    /// CAL label for a referenced statement label, creating a
    /// forward-reference placeholder when the label is not yet defined.
    pub fn reference(&mut self, label: u32) -> String {
        if let Some(u) = self.user.get(&label) {
            return u.cal.clone();
        }
        let cal = self.generate();
        self.user.insert(
            label,
            UserLabel {
                cal: cal.clone(),
                defined: false,
                forward_ref: true,
            },
        );
        cal
    }

    /// CAL label for a defining occurrence in columns 1-5.
    pub fn define(&mut self, label: u32) -> Result<String, CompileError> {
        if let Some(u) = self.user.get_mut(&label) {
            if u.defined {
                return Err(CompileError::DoubleDefinition(label.to_string()));
            }
            u.defined = true;
            u.forward_ref = false;
            return Ok(u.cal.clone());
        }
        let cal = self.generate();
        self.user.insert(
            label,
            UserLabel {
                cal: cal.clone(),
                defined: true,
                forward_ref: false,
            },
        );
        Ok(cal)
    }

    pub fn lookup(&self, label: u32) -> Option<&UserLabel> {
        self.user.get(&label)
    }

    /// Statement labels still carrying a forward reference; reported as
    /// undefined at END.
    pub fn unresolved(&self) -> impl Iterator<Item = u32> + '_ {
        self.user
            .iter()
            .filter(|(_, u)| u.forward_ref)
            .map(|(&n, _)| n)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn forward_reference_resolves_on_define() {
        let mut labels = LabelManager::new();
        let cal = labels.reference(50);
        assert!(labels.lookup(50).unwrap().forward_ref);
        let cal2 = labels.define(50).unwrap();
        assert_eq!(cal, cal2);
        assert!(!labels.lookup(50).unwrap().forward_ref);
        assert_eq!(labels.unresolved().count(), 0);
    }

    #[test]
    fn double_definition_is_an_error() {
        let mut labels = LabelManager::new();
        labels.define(10).unwrap();
        assert!(labels.define(10).is_err());
    }

    #[test]
    fn unresolved_labels_survive_to_end() {
        let mut labels = LabelManager::new();
        labels.reference(10);
        labels.reference(20);
        labels.define(10).unwrap();
        let open: Vec<u32> = labels.unresolved().collect();
        assert_eq!(open, vec![20]);
    }

    #[test]
    fn generated_labels_are_sequential() {
        let mut labels = LabelManager::new();
        assert_eq!(labels.generate(), "L00001");
        assert_eq!(labels.generate(), "L00002");
        labels.reset();
        assert_eq!(labels.generate(), "L00001");
    }
}
