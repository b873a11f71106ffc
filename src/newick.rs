use crate::error::{PipelineError, Result};
use std::path::Path;

/// One node of a parsed tree. Leaves carry the sequence id as label;
/// internal nodes may carry a bootstrap support value parsed from their
/// label (for combined `alrt/ufboot` labels the last component wins).
#[derive(Debug, Clone)]
pub struct Node {
    pub parent: Option<usize>,
    pub children: Vec<usize>,
    pub label: Option<String>,
    /// Branch length to the parent.
    pub length: f64,
    pub support: Option<f64>,
}

/// Arena-allocated phylogenetic tree parsed from Newick text. Read-only
/// once parsed.
#[derive(Debug, Clone)]
pub struct PhyloTree {
    nodes: Vec<Node>,
    root: usize,
}

impl PhyloTree {
    pub fn parse(text: &str) -> Result<Self> {
        Parser::new(text).parse()
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::parse(&text)
    }

    pub fn root(&self) -> usize {
        self.root
    }

    pub fn node(&self, id: usize) -> &Node {
        &self.nodes[id]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn is_leaf(&self, id: usize) -> bool {
        self.nodes[id].children.is_empty()
    }

    pub fn leaves(&self) -> Vec<usize> {
        (0..self.nodes.len())
            .filter(|&i| self.is_leaf(i))
            .collect()
    }

    /// All leaf ids in the subtree rooted at `id` (including `id` itself if
    /// it is a leaf).
    pub fn leaves_under(&self, id: usize) -> Vec<usize> {
        let mut out = Vec::new();
        let mut stack = vec![id];
        while let Some(n) = stack.pop() {
            if self.is_leaf(n) {
                out.push(n);
            } else {
                stack.extend(self.nodes[n].children.iter().rev());
            }
        }
        out
    }

    /// Ancestors of `id`, nearest first, ending at the root.
    pub fn ancestors(&self, id: usize) -> Vec<usize> {
        let mut out = Vec::new();
        let mut cur = self.nodes[id].parent;
        while let Some(p) = cur {
            out.push(p);
            cur = self.nodes[p].parent;
        }
        out
    }

    /// Sum of branch lengths along the path between two nodes.
    pub fn distance_between(&self, a: usize, b: usize) -> f64 {
        let mut dist_to_ancestor = std::collections::HashMap::new();
        let mut acc = 0.0;
        let mut cur = a;
        dist_to_ancestor.insert(a, 0.0);
        while let Some(p) = self.nodes[cur].parent {
            acc += self.nodes[cur].length;
            dist_to_ancestor.insert(p, acc);
            cur = p;
        }

        let mut acc_b = 0.0;
        let mut cur = b;
        loop {
            if let Some(&up) = dist_to_ancestor.get(&cur) {
                return up + acc_b;
            }
            match self.nodes[cur].parent {
                Some(p) => {
                    acc_b += self.nodes[cur].length;
                    cur = p;
                }
                None => return acc_b, // disjoint only if a/b are in different trees
            }
        }
    }
}

struct Parser<'a> {
    bytes: &'a [u8],
    pos: usize,
    nodes: Vec<Node>,
}

impl<'a> Parser<'a> {
    fn new(text: &'a str) -> Self {
        Self {
            bytes: text.as_bytes(),
            pos: 0,
            nodes: Vec::new(),
        }
    }

    fn parse(mut self) -> Result<PhyloTree> {
        self.skip_ws();
        if self.peek().is_none() {
            return Err(PipelineError::parse("empty tree"));
        }
        let root = self.parse_clade(None)?;
        self.skip_ws();
        if self.peek() == Some(b';') {
            self.pos += 1;
        }
        self.skip_ws();
        if self.peek().is_some() {
            return Err(PipelineError::parse(format!(
                "trailing input at byte {} of tree",
                self.pos
            )));
        }
        Ok(PhyloTree {
            nodes: self.nodes,
            root,
        })
    }

    fn parse_clade(&mut self, parent: Option<usize>) -> Result<usize> {
        self.skip_ws();
        let id = self.nodes.len();
        self.nodes.push(Node {
            parent,
            children: Vec::new(),
            label: None,
            length: 0.0,
            support: None,
        });

        if self.peek() == Some(b'(') {
            self.pos += 1;
            loop {
                let child = self.parse_clade(Some(id))?;
                self.nodes[id].children.push(child);
                self.skip_ws();
                match self.peek() {
                    Some(b',') => {
                        self.pos += 1;
                    }
                    Some(b')') => {
                        self.pos += 1;
                        break;
                    }
                    _ => {
                        return Err(PipelineError::parse(format!(
                            "expected ',' or ')' at byte {} of tree",
                            self.pos
                        )))
                    }
                }
            }
        }

        let label = self.take_label();
        let is_internal = !self.nodes[id].children.is_empty();
        if !label.is_empty() {
            if is_internal {
                self.nodes[id].support = parse_support(&label);
            }
            self.nodes[id].label = Some(label);
        } else if !is_internal {
            return Err(PipelineError::parse(format!(
                "leaf without a label at byte {} of tree",
                self.pos
            )));
        }

        self.skip_ws();
        if self.peek() == Some(b':') {
            self.pos += 1;
            let text = self.take_label();
            let length: f64 = text.trim().parse().map_err(|_| {
                PipelineError::parse(format!("invalid branch length '{}'", text.trim()))
            })?;
            self.nodes[id].length = length;
        }
        Ok(id)
    }

    fn take_label(&mut self) -> String {
        let start = self.pos;
        while let Some(c) = self.peek() {
            if matches!(c, b'(' | b')' | b',' | b':' | b';') || c.is_ascii_whitespace() {
                break;
            }
            self.pos += 1;
        }
        String::from_utf8_lossy(&self.bytes[start..self.pos]).into_owned()
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn skip_ws(&mut self) {
        while self.peek().map_or(false, |c| c.is_ascii_whitespace()) {
            self.pos += 1;
        }
    }
}

/// Bootstrap support from an internal node label: the label itself if
/// numeric, otherwise the last `/`-separated numeric component
/// (`alrt/ufboot` style).
fn parse_support(label: &str) -> Option<f64> {
    label
        .rsplit('/')
        .next()
        .and_then(|part| part.parse::<f64>().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf_ids(tree: &PhyloTree) -> Vec<&str> {
        tree.leaves()
            .into_iter()
            .map(|l| tree.node(l).label.as_deref().unwrap())
            .collect()
    }

    #[test]
    fn test_parse_supported_cherry() {
        let tree = PhyloTree::parse("((A_000001:0.1,B_000001:0.1)95:0.05,C_000001:0.2);")
            .unwrap();
        assert_eq!(leaf_ids(&tree), vec!["A_000001", "B_000001", "C_000001"]);

        let a = tree
            .leaves()
            .into_iter()
            .find(|&l| tree.node(l).label.as_deref() == Some("A_000001"))
            .unwrap();
        let parent = tree.node(a).parent.unwrap();
        assert_eq!(tree.node(parent).support, Some(95.0));
        assert!(tree.node(tree.root()).support.is_none());
    }

    #[test]
    fn test_parse_combined_support_label() {
        let tree =
            PhyloTree::parse("((A_000001:0.1,B_000001:0.1)87.5/92:0.05,C_000001:0.2);").unwrap();
        let a = tree.leaves()[0];
        let parent = tree.node(a).parent.unwrap();
        assert_eq!(tree.node(parent).support, Some(92.0));
    }

    #[test]
    fn test_leaves_under_subtree() {
        let tree = PhyloTree::parse("((A_1:0.1,B_1:0.1)90:0.1,(C_1:0.1,D_1:0.1)80:0.1);").unwrap();
        let a = tree
            .leaves()
            .into_iter()
            .find(|&l| tree.node(l).label.as_deref() == Some("A_1"))
            .unwrap();
        let parent = tree.node(a).parent.unwrap();
        let labels: Vec<&str> = tree
            .leaves_under(parent)
            .into_iter()
            .map(|l| tree.node(l).label.as_deref().unwrap())
            .collect();
        assert_eq!(labels, vec!["A_1", "B_1"]);
        assert_eq!(tree.leaves_under(tree.root()).len(), 4);
    }

    #[test]
    fn test_distance_between_leaves() {
        let tree = PhyloTree::parse("((A_1:0.1,B_1:0.3)95:0.05,C_1:0.2);").unwrap();
        let find = |name: &str| {
            tree.leaves()
                .into_iter()
                .find(|&l| tree.node(l).label.as_deref() == Some(name))
                .unwrap()
        };
        let d_ab = tree.distance_between(find("A_1"), find("B_1"));
        assert!((d_ab - 0.4).abs() < 1e-9);
        let d_ac = tree.distance_between(find("A_1"), find("C_1"));
        assert!((d_ac - 0.35).abs() < 1e-9);
        // Symmetric.
        assert!((tree.distance_between(find("C_1"), find("A_1")) - d_ac).abs() < 1e-9);
    }

    #[test]
    fn test_ancestors_nearest_first() {
        let tree = PhyloTree::parse("((A_1:0.1,B_1:0.1)95:0.05,C_1:0.2);").unwrap();
        let a = tree.leaves()[0];
        let ancestors = tree.ancestors(a);
        assert_eq!(ancestors.len(), 2);
        assert_eq!(ancestors[1], tree.root());
        assert_eq!(tree.node(ancestors[0]).support, Some(95.0));
    }

    #[test]
    fn test_unrooted_trifurcation() {
        let tree = PhyloTree::parse("(A_1:0.1,B_1:0.1,C_1:0.1);").unwrap();
        assert_eq!(tree.node(tree.root()).children.len(), 3);
        assert_eq!(tree.leaves().len(), 3);
    }

    #[test]
    fn test_malformed_trees_rejected() {
        assert!(PhyloTree::parse("").is_err());
        assert!(PhyloTree::parse("((A_1:0.1,B_1:0.1);").is_err());
        assert!(PhyloTree::parse("(A_1:zzz,B_1:0.1);").is_err());
        assert!(PhyloTree::parse("(A_1,B_1)extra)garbage;").is_err());
    }
}
