use crate::error::{ModelError, Result};

/// One vertex of a rooted tree. The branch length belongs to the edge above.
#[derive(Debug, Clone, PartialEq)]
pub struct TreeNode {
    pub parent: Option<usize>,
    pub children: Vec<usize>,
    pub branch_length: f64,
}

/// Rooted binary tree with stable node indices.
///
/// Tips occupy indices `0..num_tips`, internal nodes follow. Indices never
/// change after construction, so per-node caches can be keyed by them.
#[derive(Debug, Clone, PartialEq)]
pub struct Tree {
    nodes: Vec<TreeNode>,
    root: usize,
    num_tips: usize,
}

impl Tree {
    /// Build a tree from each node's parent index and branch length.
    pub fn from_parents(parents: &[Option<usize>], branch_lengths: &[f64]) -> Result<Self> {
        if parents.len() != branch_lengths.len() {
            return Err(ModelError::LengthMismatch {
                what: "branch_lengths".to_string(),
                expected: parents.len(),
                found: branch_lengths.len(),
            });
        }
        let n = parents.len();
        if n == 0 {
            return Err(ModelError::InvalidTree("tree has no nodes".to_string()));
        }

        let mut nodes: Vec<TreeNode> = branch_lengths
            .iter()
            .zip(parents)
            .map(|(&bl, &parent)| TreeNode {
                parent,
                children: Vec::new(),
                branch_length: bl,
            })
            .collect();

        let mut root = None;
        for (i, parent) in parents.iter().enumerate() {
            match *parent {
                None if root.is_some() => {
                    return Err(ModelError::InvalidTree("more than one root".to_string()))
                }
                None => root = Some(i),
                Some(p) if p >= n || p == i => {
                    return Err(ModelError::InvalidTree(format!(
                        "node {} has invalid parent {}",
                        i, p
                    )))
                }
                Some(p) => nodes[p].children.push(i),
            }
            if !(branch_lengths[i] >= 0.0 && branch_lengths[i].is_finite()) {
                return Err(ModelError::InvalidTree(format!(
                    "node {} has branch length {}",
                    i, branch_lengths[i]
                )));
            }
        }
        let root = root.ok_or_else(|| ModelError::InvalidTree("no root".to_string()))?;

        let num_tips = nodes.iter().filter(|node| node.children.is_empty()).count();
        for (i, node) in nodes.iter().enumerate() {
            let is_tip = node.children.is_empty();
            if is_tip != (i < num_tips) {
                return Err(ModelError::InvalidTree(
                    "tips must occupy the first indices".to_string(),
                ));
            }
            if !is_tip && node.children.len() != 2 {
                return Err(ModelError::InvalidTree(format!(
                    "internal node {} has {} children",
                    i,
                    node.children.len()
                )));
            }
        }

        // every node must reach the root within n steps
        for start in 0..n {
            let mut current = start;
            let mut steps = 0;
            while let Some(p) = nodes[current].parent {
                current = p;
                steps += 1;
                if steps > n {
                    return Err(ModelError::InvalidTree(format!(
                        "node {} is on a cycle",
                        start
                    )));
                }
            }
        }

        Ok(Self {
            nodes,
            root,
            num_tips,
        })
    }

    /// Ladder-shaped tree where every branch has the same length.
    pub fn caterpillar(num_tips: usize, branch_length: f64) -> Result<Self> {
        if num_tips < 2 {
            return Err(ModelError::InvalidTree(
                "a caterpillar needs at least two tips".to_string(),
            ));
        }
        let n = 2 * num_tips - 1;
        let mut parents = vec![None; n];
        parents[0] = Some(num_tips);
        for (tip, parent) in parents.iter_mut().enumerate().take(num_tips).skip(1) {
            *parent = Some(num_tips + tip - 1);
        }
        for internal in num_tips..n - 1 {
            parents[internal] = Some(internal + 1);
        }
        Self::from_parents(&parents, &vec![branch_length; n])
    }

    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    pub fn num_tips(&self) -> usize {
        self.num_tips
    }

    pub fn root(&self) -> usize {
        self.root
    }

    pub fn node(&self, index: usize) -> &TreeNode {
        &self.nodes[index]
    }

    pub fn is_tip(&self, index: usize) -> bool {
        index < self.num_tips
    }

    pub fn is_root(&self, index: usize) -> bool {
        index == self.root
    }

    pub fn branch_length(&self, index: usize) -> f64 {
        self.nodes[index].branch_length
    }

    pub fn set_branch_length(&mut self, index: usize, length: f64) {
        self.nodes[index].branch_length = length;
    }

    /// Sum of branch lengths, excluding the root's.
    pub fn tree_length(&self) -> f64 {
        self.nodes
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != self.root)
            .map(|(_, node)| node.branch_length)
            .sum()
    }

    /// Children before parents, ending at the root.
    pub fn postorder(&self) -> Vec<usize> {
        let mut order = Vec::with_capacity(self.nodes.len());
        let mut stack = vec![(self.root, false)];
        while let Some((index, expanded)) = stack.pop() {
            if expanded {
                order.push(index);
            } else {
                stack.push((index, true));
                for &child in self.nodes[index].children.iter().rev() {
                    stack.push((child, false));
                }
            }
        }
        order
    }

    /// `index`, its parent, and so on up to and including the root.
    pub fn path_to_root(&self, index: usize) -> impl Iterator<Item = usize> + '_ {
        std::iter::successors(Some(index), move |&i| self.nodes[i].parent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_caterpillar_shape() {
        let tree = Tree::caterpillar(4, 1.0).unwrap();
        assert_eq!(tree.num_nodes(), 7);
        assert_eq!(tree.num_tips(), 4);
        assert_eq!(tree.root(), 6);
        assert_eq!(tree.node(4).children, vec![0, 1]);
        assert!((tree.tree_length() - 6.0).abs() < 1e-12);
    }

    #[test]
    fn test_postorder_visits_children_first() {
        let tree = Tree::caterpillar(5, 0.5).unwrap();
        let order = tree.postorder();
        assert_eq!(order.len(), tree.num_nodes());
        assert_eq!(*order.last().unwrap(), tree.root());
        let position = |i: usize| order.iter().position(|&x| x == i).unwrap();
        for i in 0..tree.num_nodes() {
            if let Some(p) = tree.node(i).parent {
                assert!(position(i) < position(p), "{} must precede {}", i, p);
            }
        }
    }

    #[test]
    fn test_path_to_root() {
        let tree = Tree::caterpillar(4, 1.0).unwrap();
        let path: Vec<usize> = tree.path_to_root(0).collect();
        assert_eq!(path, vec![0, 4, 5, 6]);
    }

    #[test]
    fn test_rejects_malformed_trees() {
        // two roots
        assert!(Tree::from_parents(&[None, None], &[1.0, 1.0]).is_err());
        // cycle between the two internal nodes
        let parents = [Some(2), Some(2), Some(3), Some(2), None];
        assert!(Tree::from_parents(&parents, &[1.0; 5]).is_err());
        // length mismatch
        assert!(matches!(
            Tree::from_parents(&[Some(2), Some(2), None], &[1.0, 1.0]),
            Err(ModelError::LengthMismatch { .. })
        ));
        // tips after internal nodes
        let parents = [None, Some(0), Some(0)];
        assert!(Tree::from_parents(&parents, &[0.0, 1.0, 1.0]).is_err());
    }
}
