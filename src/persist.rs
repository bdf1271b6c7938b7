// used for persistence
use std::time::Instant;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Error, Statement};
use tracing::{debug, info};

use crate::codec::{
    check_model_binding, check_trees, decode_model, encode_model, model_mismatch, EdgeRecord,
    VertexRecord,
};
use crate::error::{BlockGibbsError, Result};
use crate::graph::Graph;
use crate::model::FactorizedModel;

/// Bookkeeping row of a stored checkpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointInfo {
    pub id: i64,
    pub taken_at: DateTime<Utc>,
    pub vertices: usize,
    pub edges: usize,
}

fn verify(what: &str, record: &[u8], digest: &[u8]) -> Result<()> {
    if blake3::hash(record).as_bytes().as_slice() == digest {
        Ok(())
    } else {
        Err(BlockGibbsError::DataCorruption {
            message: format!("digest mismatch for {what}"),
        })
    }
}

fn corrupt(message: String) -> BlockGibbsError {
    BlockGibbsError::DataCorruption { message }
}

/// Stores checkpoints in SQLite: the model as one codec record, then one
/// record per vertex and per edge, each next to its blake3 digest.
pub struct Persistor<'db> {
    db: &'db Connection,
    add_checkpoint: Statement<'db>,
    add_model: Statement<'db>,
    add_vertex: Statement<'db>,
    add_edge: Statement<'db>,
    get_checkpoint: Statement<'db>,
    latest_checkpoint: Statement<'db>,
    checkpoint_model: Statement<'db>,
    checkpoint_vertices: Statement<'db>,
    checkpoint_edges: Statement<'db>,
}
impl<'db> Persistor<'db> {
    pub fn new<'connection>(connection: &'connection Connection) -> Result<Persistor<'connection>> {
        // The "STRICT" keyword introduced in 3.37.0 breaks JDBC connections, which makes
        // debugging using an external tool like DBeaver impossible
        connection.execute_batch(
            "
            create table if not exists Checkpoint (
                Checkpoint_Identity integer not null,
                TakenAt text not null,
                Vertices integer not null,
                Edges integer not null,
                constraint referenceable_Checkpoint_Identity primary key (
                    Checkpoint_Identity
                )
            );-- STRICT;
            create table if not exists Model (
                Checkpoint_Identity integer not null,
                Record blob not null,
                Digest blob not null,
                constraint Model_in_Checkpoint foreign key (
                    Checkpoint_Identity
                ) references Checkpoint(Checkpoint_Identity),
                constraint unique_Model primary key (
                    Checkpoint_Identity
                )
            );-- STRICT;
            create table if not exists VertexState (
                Checkpoint_Identity integer not null,
                Vertex_Identity integer not null,
                Record blob not null,
                Digest blob not null,
                constraint VertexState_in_Checkpoint foreign key (
                    Checkpoint_Identity
                ) references Checkpoint(Checkpoint_Identity),
                constraint unique_VertexState primary key (
                    Checkpoint_Identity,
                    Vertex_Identity
                )
            );-- STRICT;
            create table if not exists EdgeState (
                Checkpoint_Identity integer not null,
                Edge_Identity integer not null,
                Source_Identity integer not null,
                Target_Identity integer not null,
                Record blob not null,
                Digest blob not null,
                constraint EdgeState_in_Checkpoint foreign key (
                    Checkpoint_Identity
                ) references Checkpoint(Checkpoint_Identity),
                constraint unique_EdgeState primary key (
                    Checkpoint_Identity,
                    Edge_Identity
                )
            );-- STRICT;
            ",
        )?;
        Ok(Persistor {
            db: connection,
            add_checkpoint: connection.prepare(
                "
                insert into Checkpoint (
                    TakenAt,
                    Vertices,
                    Edges
                ) values (?, ?, ?)
            ",
            )?,
            add_model: connection.prepare(
                "
                insert into Model (
                    Checkpoint_Identity,
                    Record,
                    Digest
                ) values (?, ?, ?)
            ",
            )?,
            add_vertex: connection.prepare(
                "
                insert into VertexState (
                    Checkpoint_Identity,
                    Vertex_Identity,
                    Record,
                    Digest
                ) values (?, ?, ?, ?)
            ",
            )?,
            add_edge: connection.prepare(
                "
                insert into EdgeState (
                    Checkpoint_Identity,
                    Edge_Identity,
                    Source_Identity,
                    Target_Identity,
                    Record,
                    Digest
                ) values (?, ?, ?, ?, ?, ?)
            ",
            )?,
            get_checkpoint: connection.prepare(
                "
                select TakenAt, Vertices, Edges
                    from Checkpoint
                    where Checkpoint_Identity = ?
            ",
            )?,
            latest_checkpoint: connection.prepare(
                "
                select max(Checkpoint_Identity)
                    from Checkpoint
            ",
            )?,
            checkpoint_model: connection.prepare(
                "
                select Record, Digest
                    from Model
                    where Checkpoint_Identity = ?
            ",
            )?,
            checkpoint_vertices: connection.prepare(
                "
                select Vertex_Identity, Record, Digest
                    from VertexState
                    where Checkpoint_Identity = ?
                    order by Vertex_Identity
            ",
            )?,
            checkpoint_edges: connection.prepare(
                "
                select Source_Identity, Target_Identity, Record, Digest
                    from EdgeState
                    where Checkpoint_Identity = ?
                    order by Edge_Identity
            ",
            )?,
        })
    }

    /// Writes the model and the graph built from it as one checkpoint and
    /// returns its identity. Take checkpoints while no sweep is running,
    /// otherwise vertices are captured at different moments.
    pub fn checkpoint(&mut self, model: &FactorizedModel, graph: &Graph) -> Result<i64> {
        if let Some(message) = model_mismatch(model, graph) {
            return Err(BlockGibbsError::Contract(message));
        }
        let start = Instant::now();
        let tx = self.db.unchecked_transaction()?;
        self.add_checkpoint.execute(params![
            Utc::now(),
            graph.num_vertices() as i64,
            graph.num_edges() as i64
        ])?;
        let id = self.db.last_insert_rowid();
        let record = encode_model(model)?;
        let digest = blake3::hash(&record);
        self.add_model
            .execute(params![id, record, digest.as_bytes().as_slice()])?;
        for vertex in graph.vertices() {
            let record = VertexRecord::capture(vertex)?.to_bytes()?;
            let digest = blake3::hash(&record);
            self.add_vertex.execute(params![
                id,
                vertex.id(),
                record,
                digest.as_bytes().as_slice()
            ])?;
        }
        for (edge_id, edge) in graph.edges().enumerate() {
            let record = EdgeRecord::capture(graph, edge)?.to_bytes()?;
            let digest = blake3::hash(&record);
            self.add_edge.execute(params![
                id,
                edge_id as i64,
                edge.source(),
                edge.target(),
                record,
                digest.as_bytes().as_slice()
            ])?;
        }
        tx.commit()?;
        info!(
            checkpoint = id,
            vertices = graph.num_vertices(),
            edges = graph.num_edges(),
            ms = start.elapsed().as_millis() as u64,
            "checkpoint written"
        );
        Ok(id)
    }

    pub fn latest_checkpoint(&mut self) -> Result<Option<i64>> {
        Ok(self
            .latest_checkpoint
            .query_row([], |r| r.get::<_, Option<i64>>(0))?)
    }

    pub fn checkpoint_info(&mut self, id: i64) -> Result<Option<CheckpointInfo>> {
        match self.get_checkpoint.query_row(params![id], |r| {
            Ok(CheckpointInfo {
                id,
                taken_at: r.get(0)?,
                vertices: r.get::<_, i64>(1)? as usize,
                edges: r.get::<_, i64>(2)? as usize,
            })
        }) {
            Ok(info) => Ok(Some(info)),
            Err(Error::QueryReturnedNoRows) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// Rebuilds the model and graph stored under `id`. Every record is
    /// checked against its digest and decoded, and the assembled graph must
    /// hold consistent trees over the factors of the model.
    pub fn restore(&mut self, id: i64) -> Result<(FactorizedModel, Graph)> {
        let start = Instant::now();
        let info = self.checkpoint_info(id)?.ok_or_else(|| {
            BlockGibbsError::Persistence(format!("checkpoint {id} does not exist"))
        })?;

        let (record, digest) = match self.checkpoint_model.query_row(params![id], |r| {
            Ok((r.get::<_, Vec<u8>>(0)?, r.get::<_, Vec<u8>>(1)?))
        }) {
            Ok(row) => row,
            Err(Error::QueryReturnedNoRows) => {
                return Err(corrupt(format!("checkpoint {id} stores no model")));
            }
            Err(err) => return Err(err.into()),
        };
        verify("model", &record, &digest)?;
        let model = decode_model(&record)?;

        let rows = self
            .checkpoint_vertices
            .query_map(params![id], |r| {
                Ok((
                    r.get::<_, i64>(0)?,
                    r.get::<_, Vec<u8>>(1)?,
                    r.get::<_, Vec<u8>>(2)?,
                ))
            })?
            .collect::<std::result::Result<Vec<_>, Error>>()?;
        if rows.len() != info.vertices {
            return Err(corrupt(format!(
                "checkpoint {id} lists {} vertices but stores {}",
                info.vertices,
                rows.len()
            )));
        }
        let mut vertices = Vec::with_capacity(rows.len());
        for (vertex_id, record, digest) in rows {
            verify(&format!("vertex {vertex_id}"), &record, &digest)?;
            let record = VertexRecord::from_bytes(&record)?;
            if i64::from(record.variable.id()) != vertex_id {
                return Err(corrupt(format!(
                    "row of vertex {vertex_id} holds variable {}",
                    record.variable.id()
                )));
            }
            vertices.push(record.into_vertex());
        }
        let mut graph = Graph::new(vertices).map_err(|e| corrupt(e.to_string()))?;

        let rows = self
            .checkpoint_edges
            .query_map(params![id], |r| {
                Ok((
                    r.get::<_, u32>(0)?,
                    r.get::<_, u32>(1)?,
                    r.get::<_, Vec<u8>>(2)?,
                    r.get::<_, Vec<u8>>(3)?,
                ))
            })?
            .collect::<std::result::Result<Vec<_>, Error>>()?;
        if rows.len() != info.edges {
            return Err(corrupt(format!(
                "checkpoint {id} lists {} edges but stores {}",
                info.edges,
                rows.len()
            )));
        }
        for (source, target, record, digest) in rows {
            verify(&format!("edge {source}->{target}"), &record, &digest)?;
            let endpoint = |vertex| {
                graph
                    .get_vertex(vertex)
                    .map(|v| v.variable())
                    .ok_or_else(|| corrupt(format!("edge endpoint {vertex} out of range")))
            };
            let (source, target) = (endpoint(source)?, endpoint(target)?);
            let edge = EdgeRecord::from_bytes(&record, source, target)?.into_edge();
            graph.add_edge(edge).map_err(|e| corrupt(e.to_string()))?;
        }
        check_trees(&graph)?;
        check_model_binding(&model, &graph)?;
        debug!(
            checkpoint = id,
            vertices = graph.num_vertices(),
            edges = graph.num_edges(),
            ms = start.elapsed().as_millis() as u64,
            "checkpoint restored"
        );
        Ok((model, graph))
    }

    pub fn restore_latest(&mut self) -> Result<Option<(FactorizedModel, Graph)>> {
        match self.latest_checkpoint()? {
            Some(id) => self.restore(id).map(Some),
            None => Ok(None),
        }
    }
}
