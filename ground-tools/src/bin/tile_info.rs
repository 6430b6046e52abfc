#![warn(clippy::all)]

use std::path::PathBuf;

use anyhow::{anyhow, bail, Result};
use clap::{value_t, App, Arg};
use ground_algorithms::{
    outliers::OutlierExcluder,
    params::GroundDetectionParameters,
    quadtree::{Quadtree, SplitLimits},
    seeds::SeedSelector,
    surface::Surface,
};
use ground_core::{
    nalgebra::Point3,
    source::{Channels, InMemoryPointSource, PointSource},
};
use ground_tools::xyz::read_positions_from_file;

struct Args {
    pub input_file: PathBuf,
    pub max_structure_size: f64,
    pub max_points_per_tile: usize,
    pub position: Option<Point3<f64>>,
}

fn parse_position(value: &str) -> Result<Point3<f64>> {
    let coordinates = value
        .split(',')
        .map(|c| c.trim().parse::<f64>())
        .collect::<Result<Vec<_>, _>>()?;
    if coordinates.len() != 2 {
        bail!("Expected 'x,y', got '{}'", value);
    }
    Ok(Point3::new(coordinates[0], coordinates[1], 0.0))
}

fn get_args() -> Result<Args> {
    let defaults = GroundDetectionParameters::default();
    let default_size = defaults.max_structure_size.to_string();
    let default_points = defaults.max_points_per_tile.to_string();
    let matches = App::new("tile info")
        .version("0.1")
        .about("Prints the quadtree tiles, seeds and ground surface of an XYZ point cloud")
        .arg(
            Arg::with_name("INPUT")
                .short("i")
                .takes_value(true)
                .value_name("INPUT")
                .help("Input XYZ file")
                .required(true),
        )
        .arg(
            Arg::with_name("STRUCTURE_SIZE")
                .long("structure-size")
                .takes_value(true)
                .default_value(&default_size)
                .help("Edge length of the largest non-ground structure"),
        )
        .arg(
            Arg::with_name("MAX_POINTS")
                .long("max-points")
                .takes_value(true)
                .default_value(&default_points)
                .help("Maximum number of points per tile"),
        )
        .arg(
            Arg::with_name("AT")
                .long("at")
                .takes_value(true)
                .value_name("X,Y")
                .help("Print the surface triangle below this position"),
        )
        .get_matches();

    Ok(Args {
        input_file: PathBuf::from(matches.value_of("INPUT").ok_or_else(|| anyhow!("Missing input"))?),
        max_structure_size: value_t!(matches, "STRUCTURE_SIZE", f64)?,
        max_points_per_tile: value_t!(matches, "MAX_POINTS", usize)?,
        position: matches.value_of("AT").map(parse_position).transpose()?,
    })
}

fn main() -> Result<()> {
    pretty_env_logger::init();

    let args = get_args()?;
    let params = GroundDetectionParameters::default()
        .with_max_structure_size(args.max_structure_size)
        .with_max_points_per_tile(args.max_points_per_tile);

    let mut source = InMemoryPointSource::new(read_positions_from_file(&args.input_file)?);
    let bounds = source
        .bounds()
        .ok_or_else(|| anyhow!("{} contains no points", args.input_file.display()))?;
    println!("Points: {}", source.len());
    println!("Bounds: {:?} - {:?}", bounds.min(), bounds.max());

    let limits = SplitLimits {
        tile_size: params.tile_size(),
        max_data_size: params.max_points_per_tile,
        max_depth: params.max_tree_depth,
    };
    let (mut tree, tiles) = Quadtree::build(bounds, &mut source, limits)?;
    println!(
        "Quadtree: {} nodes, {} leaves, {} with visible points, depth {}",
        tree.len(),
        tree.leaves().count(),
        tiles.len(),
        tree.max_depth()
    );

    let selector = SeedSelector::new(&params, tree.max_depth());
    let mut seeds = Vec::with_capacity(tiles.len());
    println!("Tile\tDepth\tPoints\tSeeds\tTrust\tDensity");
    for tile in &tiles {
        let node = tree.node(*tile);
        let buffer = source.query_points(node.region(), Channels::GEOMETRY)?;
        let seed = selector.select(*tile, node, &buffer);
        println!(
            "{}\t{}\t{}\t{}\t{:.3}\t{:.3}",
            tile.index(),
            node.depth(),
            node.point_count(),
            seed.points().len(),
            seed.trustworthiness(),
            seed.density()
        );
        seeds.push(seed);
    }

    let exclusion = OutlierExcluder::new(&params).exclude(&tree, &mut seeds);
    println!(
        "Outliers: {} sparse tiles cleared, {} seed points removed",
        exclusion.cleared_tiles, exclusion.removed_points
    );

    let seed_points: Vec<Point3<f64>> = seeds
        .iter()
        .flat_map(|seed| seed.points().iter().copied())
        .collect();
    let surface = Surface::triangulate(&seed_points);
    tree.index_triangles(&surface);
    println!(
        "Surface: {} triangles from {} seed points",
        surface.triangle_count(),
        seed_points.len()
    );
    if let Some(extent) = surface.bounds() {
        println!("Surface bounds: {:?} - {:?}", extent.min(), extent.max());
    }

    if let Some(position) = args.position {
        let leaf = tree.leaf_at(&position);
        match tree.find_triangle(&position, &surface) {
            Some(triangle) => println!(
                "Triangle below ({}, {}) in tile {}: {:?}",
                position.x,
                position.y,
                leaf.index(),
                surface.triangle(triangle)
            ),
            None => println!("No triangle below ({}, {})", position.x, position.y),
        }
    }
    Ok(())
}
