use tabbycat::Graph;
use tabbycat::{Edge, GraphBuilder, GraphType, Identity, Stmt, StmtList};

use super::{KernelGraph, TensorId};

impl KernelGraph {
    /// Graphviz rendering of the graph: one box per node, one ellipse per
    /// tensor slot, labelled with the descriptor once setup resolved it.
    pub fn graphvis(&self) -> Graph {
        let mut statements = Vec::new();
        let tensors = (0..self.inputs.len())
            .map(TensorId::Input)
            .chain((0..self.outputs.len()).map(TensorId::Output))
            .chain((0..self.internals.len()).map(TensorId::Internal));
        for id in tensors {
            statements.push(Stmt::Node {
                id: self.tensor_identity(id),
                port: None,
                attr: None,
            });
        }
        for node in &self.nodes {
            let id = Identity::quoted(format!("{} ({})", node.name(), node.param().name()));
            statements.push(Stmt::Node {
                id: id.clone(),
                port: None,
                attr: None,
            });
            for input in node.input_ids() {
                statements.push(Stmt::Edge(
                    Edge::head_node(self.tensor_identity(*input), None)
                        .arrow_to_node(id.clone(), None),
                ));
            }
            for output in node.output_ids() {
                statements.push(Stmt::Edge(
                    Edge::head_node(id.clone(), None)
                        .arrow_to_node(self.tensor_identity(*output), None),
                ));
            }
        }
        GraphBuilder::default()
            .graph_type(GraphType::DiGraph)
            .strict(false)
            .id(Identity::quoted(self.name.clone()))
            .stmts(StmtList::new().extend(statements))
            .build()
            .expect("graph type, id and statements are always set")
    }

    fn tensor_identity(&self, id: TensorId) -> Identity {
        let name = self.slot(id).map(|slot| slot.name.as_str()).unwrap_or("?");
        match self.tensor(id) {
            Some(tensor) => Identity::quoted(format!("{id} {name}: {}", tensor.desc)),
            None => Identity::quoted(format!("{id} {name}")),
        }
    }
}

#[cfg(test)]
#[test]
fn test_graphvis_lists_nodes_and_tensors() {
    use crate::{
        graph::KernelGraphNode,
        op::{ActivationKind, ActivationParam},
    };

    let mut graph = KernelGraph::new("relu");
    let x = graph.create_input("x");
    let out = graph.create_output("y");
    graph.add_node(
        KernelGraphNode::new("act", ActivationParam::new(ActivationKind::Relu))
            .input(x)
            .output(out),
    );
    let dot = graph.graphvis().to_string();
    assert!(dot.contains("act (activation)"), "{dot}");
    assert!(dot.contains("input[0] x"), "{dot}");
    assert!(dot.contains("output[0] y"), "{dot}");
}
