//! Results of a call, eval or resume
//!
//! Values are copied off the interpreter stack as soon as the call returns,
//! so a `Results` stays valid across later interpreter calls and the stack
//! is back at its previous depth before the caller sees it.

use crate::value::Value;
use std::ops::Index;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Results {
    values: Vec<Value>,
}

impl Results {
    pub fn new(values: Vec<Value>) -> Self {
        Results { values }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Value> {
        self.values.get(index)
    }

    /// First result, the one a single-value call site wants
    pub fn first(&self) -> Option<&Value> {
        self.values.first()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Value> {
        self.values.iter()
    }

    pub fn as_slice(&self) -> &[Value] {
        &self.values
    }

    pub fn into_vec(self) -> Vec<Value> {
        self.values
    }
}

impl From<Vec<Value>> for Results {
    fn from(values: Vec<Value>) -> Self {
        Results::new(values)
    }
}

impl Index<usize> for Results {
    type Output = Value;

    fn index(&self, index: usize) -> &Value {
        &self.values[index]
    }
}

impl IntoIterator for Results {
    type Item = Value;
    type IntoIter = std::vec::IntoIter<Value>;

    fn into_iter(self) -> Self::IntoIter {
        self.values.into_iter()
    }
}

impl<'a> IntoIterator for &'a Results {
    type Item = &'a Value;
    type IntoIter = std::slice::Iter<'a, Value>;

    fn into_iter(self) -> Self::IntoIter {
        self.values.iter()
    }
}
